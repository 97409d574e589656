// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle management.
//!
//! [`RunManager`] is the only place run status is written. Every change is
//! validated against the state machine before it reaches the store.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::persistence::{NewRun, RunFilter, RunPatch, RunRecord, RunStep, RunStore};
use crate::state_machine::{RunStatus, TransitionContext, describe_transition, validate_transition};

/// Creates runs and applies validated status transitions.
#[derive(Clone)]
pub struct RunManager {
    store: Arc<dyn RunStore>,
}

impl RunManager {
    /// Wrap a run store.
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Create a run in `pending`.
    pub async fn create_run(&self, input: NewRun) -> Result<RunRecord> {
        if input.tenant_id.is_empty() {
            return Err(CoreError::validation("tenant_id", "must not be empty"));
        }
        if input.run_type.is_empty() {
            return Err(CoreError::validation("run_type", "must not be empty"));
        }

        let run = RunRecord::new(input, Utc::now());
        self.store.create_run(&run).await?;

        info!(
            run_id = %run.id,
            tenant_id = %run.tenant_id,
            run_type = %run.run_type,
            "Run created"
        );
        Ok(run)
    }

    /// Fetch a run, failing with `RunNotFound`.
    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Fetch a run if it exists.
    pub async fn find_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.store.get_run(run_id).await
    }

    /// List runs matching a filter.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        self.store.list_runs(filter).await
    }

    /// Number of non-terminal runs, optionally for one tenant.
    pub async fn count_in_flight(&self, tenant_id: Option<&str>) -> Result<i64> {
        self.store.count_in_flight_runs(tenant_id).await
    }

    /// Move a run to `to`, applying `patch` in the same write.
    ///
    /// Entering a terminal status stamps `completed_at` and `duration_ms`. A
    /// self-transition with an empty patch returns the run untouched.
    pub async fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        context: &TransitionContext,
        mut patch: RunPatch,
    ) -> Result<RunRecord> {
        let run = self.get_run(run_id).await?;
        let from = run.status;

        let mut context = context.clone();
        context.run_id.get_or_insert_with(|| run_id.to_string());
        validate_transition(from, to, &context)?;

        if from == to && patch.is_empty() {
            debug!(run_id = %run_id, status = %to, "No-op transition");
            return Ok(run);
        }

        patch.status = Some(to);
        if to.is_terminal() && from != to {
            let now = Utc::now();
            patch.completed_at.get_or_insert(now);
            patch
                .duration_ms
                .get_or_insert((now - run.created_at).num_milliseconds());
        }

        let updated = self.store.update_run(run_id, &patch).await?;
        info!(
            run_id = %run_id,
            tenant_id = %updated.tenant_id,
            from = %from,
            to = %to,
            event = describe_transition(from, to),
            "Run status changed"
        );
        Ok(updated)
    }

    /// `pending`/paused → `running`.
    pub async fn start_run(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(
            run_id,
            RunStatus::Running,
            &TransitionContext::for_run(run_id),
            RunPatch::default(),
        )
        .await
    }

    /// Park a running run until a human approves.
    pub async fn await_approval(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(
            run_id,
            RunStatus::AwaitingApproval,
            &TransitionContext::for_run(run_id),
            RunPatch::default(),
        )
        .await
    }

    /// Park a running run until an external callback arrives.
    pub async fn wait_external(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(
            run_id,
            RunStatus::WaitingExternal,
            &TransitionContext::for_run(run_id),
            RunPatch::default(),
        )
        .await
    }

    /// Finish a run successfully.
    pub async fn complete_run(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(
            run_id,
            RunStatus::Completed,
            &TransitionContext::for_run(run_id),
            RunPatch::default(),
        )
        .await
    }

    /// Finish a run with an error.
    pub async fn fail_run(&self, run_id: &str, error: impl Into<String>) -> Result<RunRecord> {
        self.transition(
            run_id,
            RunStatus::Failed,
            &TransitionContext::for_run(run_id),
            RunPatch {
                error: Some(error.into()),
                ..Default::default()
            },
        )
        .await
    }

    /// Insert or replace a step (matched by id) on a non-terminal run.
    pub async fn record_step(&self, run_id: &str, step: RunStep) -> Result<RunRecord> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(CoreError::validation(
                "status",
                format!("run '{run_id}' is {} and can no longer change", run.status),
            ));
        }

        let mut steps = run.steps;
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step,
            None => steps.push(step),
        }

        self.store
            .update_run(
                run_id,
                &RunPatch {
                    steps: Some(steps),
                    ..Default::default()
                },
            )
            .await
    }
}
