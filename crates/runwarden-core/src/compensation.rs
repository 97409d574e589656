// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compensation framework for rolling back a cancelled run.
//!
//! Step executors register a [`CompensationAction`] for every side effect they
//! perform. On cancellation the registry executes each action exactly once, in
//! descending priority order (highest first). Individual failures never abort
//! the rollback; they are collected in a [`CompensationSummary`], and a failed
//! `critical` action marks the rollback incomplete.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};

/// Lifecycle of a compensation registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationState {
    /// Nothing registered yet.
    None,
    /// Actions registered, rollback not started.
    Pending,
    /// Rollback is running.
    Triggered,
    /// Rollback finished with no critical failures.
    Completed,
    /// Rollback finished with at least one critical failure.
    Failed,
}

type CompensationFn = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<(), String>> + Send>;

/// A rollback step registered during forward execution.
pub struct CompensationAction {
    /// Unique id within the registry.
    pub id: String,
    /// What the action undoes.
    pub description: String,
    /// Higher priorities run first.
    pub priority: i32,
    /// A failure of a critical action marks the rollback incomplete.
    pub critical: bool,
    execute: CompensationFn,
}

impl fmt::Debug for CompensationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensationAction")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("priority", &self.priority)
            .field("critical", &self.critical)
            .finish()
    }
}

impl CompensationAction {
    /// Create a non-critical action with priority 0.
    pub fn new<F, Fut, E>(id: impl Into<String>, description: impl Into<String>, execute: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        Self {
            id: id.into(),
            description: description.into(),
            priority: 0,
            critical: false,
            execute: Box::new(move || {
                execute()
                    .map(|result| result.map_err(|e| e.to_string()))
                    .boxed()
            }),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the action critical.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Outcome of a single compensation action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationResult {
    /// Action id.
    pub action_id: String,
    /// Action description.
    pub description: String,
    /// Priority it ran with.
    pub priority: i32,
    /// Whether it was critical.
    pub critical: bool,
    /// Whether it succeeded.
    pub success: bool,
    /// Failure message (error or panic).
    pub error: Option<String>,
    /// Wall time spent.
    pub duration_ms: u64,
}

/// Aggregate outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationSummary {
    /// Number of actions executed.
    pub total: usize,
    /// Number that succeeded.
    pub succeeded: usize,
    /// Number that failed.
    pub failed: usize,
    /// Number of failed critical actions.
    pub critical_failures: usize,
    /// False iff any critical action failed.
    pub rollback_complete: bool,
    /// Per-action results in execution order.
    pub results: Vec<CompensationResult>,
}

#[derive(Default)]
struct RegistryState {
    actions: Vec<CompensationAction>,
    executed: bool,
    outcome: Option<CompensationState>,
}

/// Ordered, at-most-once registry of rollback actions.
#[derive(Default)]
pub struct CompensationRegistry {
    state: Mutex<RegistryState>,
}

impl fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CompensationRegistry")
            .field("actions", &state.actions)
            .field("executed", &state.executed)
            .finish()
    }
}

impl CompensationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a rollback action.
    ///
    /// Rejected after `execute_compensations` has run and for duplicate ids.
    pub fn register(&self, action: CompensationAction) -> Result<()> {
        let mut state = self.lock();
        if state.executed {
            return Err(CoreError::CompensationRegistrationClosed {
                action_id: action.id,
            });
        }
        if state.actions.iter().any(|existing| existing.id == action.id) {
            return Err(CoreError::DuplicateCompensation {
                action_id: action.id,
            });
        }

        debug!(
            action_id = %action.id,
            priority = action.priority,
            critical = action.critical,
            "Registered compensation action"
        );
        state.actions.push(action);
        Ok(())
    }

    /// Number of actions waiting to run.
    pub fn len(&self) -> usize {
        self.lock().actions.len()
    }

    /// Whether no actions are waiting to run.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CompensationState {
        let state = self.lock();
        match state.outcome {
            Some(outcome) => outcome,
            None if state.executed => CompensationState::Triggered,
            None if state.actions.is_empty() => CompensationState::None,
            None => CompensationState::Pending,
        }
    }

    /// Run every registered action once, highest priority first.
    ///
    /// Never fails because of an action; failures and panics are captured in the
    /// summary. Errors only if called a second time.
    pub async fn execute_compensations(&self) -> Result<CompensationSummary> {
        let mut actions = {
            let mut state = self.lock();
            if state.executed {
                return Err(CoreError::CompensationAlreadyExecuted);
            }
            state.executed = true;
            std::mem::take(&mut state.actions)
        };

        // Stable sort keeps registration order among equal priorities.
        actions.sort_by(|a, b| b.priority.cmp(&a.priority));

        info!(count = actions.len(), "Executing compensations");

        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let CompensationAction {
                id,
                description,
                priority,
                critical,
                execute,
            } = action;

            let started = Instant::now();
            let outcome = AssertUnwindSafe(execute()).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(message),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            match &error {
                None => debug!(action_id = %id, "Compensation succeeded"),
                Some(message) if critical => {
                    error!(action_id = %id, error = %message, "Critical compensation failed")
                }
                Some(message) => warn!(action_id = %id, error = %message, "Compensation failed"),
            }

            results.push(CompensationResult {
                action_id: id,
                description,
                priority,
                critical,
                success: error.is_none(),
                error,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let summary = summarize(results);
        self.lock().outcome = Some(if summary.rollback_complete {
            CompensationState::Completed
        } else {
            CompensationState::Failed
        });

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rollback_complete = summary.rollback_complete,
            "Compensations finished"
        );
        Ok(summary)
    }
}

fn summarize(results: Vec<CompensationResult>) -> CompensationSummary {
    let succeeded = results.iter().filter(|r| r.success).count();
    let critical_failures = results.iter().filter(|r| !r.success && r.critical).count();
    CompensationSummary {
        total: results.len(),
        succeeded,
        failed: results.len() - succeeded,
        critical_failures,
        rollback_complete: critical_failures == 0,
        results,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
