// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! All state lives behind one async mutex so every check-and-set is atomic with
//! respect to concurrent callers in the same process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::state_machine::RunStatus;

use super::{
    CheckpointStore, ClaimOutcome, ClaimRequest, IdempotencyRecord, IdempotencyStatus,
    IdempotencyStore, RunFilter, RunPatch, RunRecord, RunStore, StepCheckpoint,
};

#[derive(Default)]
struct State {
    runs: HashMap<String, RunRecord>,
    checkpoints: HashMap<String, Vec<StepCheckpoint>>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

/// Map-backed persistence for tests and single-process embedding.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    state: Arc<Mutex<State>>,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryPersistence {
    async fn create_run(&self, run: &RunRecord) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.runs.contains_key(&run.id) {
            return Err(CoreError::RunAlreadyExists {
                run_id: run.id.clone(),
            });
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        Ok(self.state.lock().await.runs.get(run_id).cloned())
    }

    async fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<RunRecord, CoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        patch.apply(run, Utc::now());
        Ok(run.clone())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, CoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<RunRecord> = state
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit.max(0) as usize);
        }
        Ok(runs)
    }

    async fn count_in_flight_runs(&self, tenant_id: Option<&str>) -> Result<i64, CoreError> {
        let state = self.state.lock().await;
        let count = state
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .filter(|run| tenant_id.is_none_or(|t| run.tenant_id == t))
            .count();
        Ok(count as i64)
    }

    async fn record_heartbeat(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_epoch: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.get_mut(run_id) else {
            return Ok(false);
        };
        let owner_ok = run.owner_id.as_deref().is_none_or(|o| o == owner_id);
        let leased = matches!(
            run.status,
            RunStatus::Running | RunStatus::AwaitingApproval | RunStatus::WaitingExternal
        );
        if !leased || run.lease_epoch != lease_epoch || !owner_ok {
            return Ok(false);
        }
        run.owner_id = Some(owner_id.to_string());
        run.last_heartbeat_at = Some(at);
        Ok(true)
    }

    async fn reassign_owner(
        &self,
        run_id: &str,
        expected_epoch: i64,
        stale_before: Option<DateTime<Utc>>,
        new_owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError> {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.get_mut(run_id) else {
            return Ok(None);
        };
        if run.lease_epoch != expected_epoch
            || run.status.is_terminal()
            || stale_before.is_some_and(|cutoff| run.last_seen_at() >= cutoff)
        {
            return Ok(None);
        }
        run.owner_id = Some(new_owner.to_string());
        run.lease_epoch += 1;
        run.last_heartbeat_at = Some(at);
        run.updated_at = at;
        Ok(Some(run.clone()))
    }
}

#[async_trait]
impl CheckpointStore for InMemoryPersistence {
    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let log = state.checkpoints.entry(run_id.to_string()).or_default();
        // Stable insert keeps write order among equal timestamps.
        let pos = log.partition_point(|c| c.timestamp <= checkpoint.timestamp);
        log.insert(pos, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoints(&self, run_id: &str) -> Result<Vec<StepCheckpoint>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.checkpoints.get(run_id).cloned().unwrap_or_default())
    }

    async fn get_latest_checkpoint(
        &self,
        run_id: &str,
    ) -> Result<Option<StepCheckpoint>, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .checkpoints
            .get(run_id)
            .and_then(|log| log.last().cloned()))
    }

    async fn clear_checkpoints(&self, run_id: &str) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .checkpoints
            .remove(run_id)
            .map(|log| log.len() as u64)
            .unwrap_or(0))
    }

    async fn has_checkpoints(&self, run_id: &str) -> Result<bool, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .checkpoints
            .get(run_id)
            .is_some_and(|log| !log.is_empty()))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryPersistence {
    async fn check_and_set(&self, request: &ClaimRequest) -> Result<ClaimOutcome, CoreError> {
        let mut state = self.state.lock().await;
        let record = match state.idempotency.get(&request.key) {
            None => request.to_record(),
            Some(existing) if request.can_reclaim(existing) => request.reclaim(existing),
            Some(existing) => return Ok(ClaimOutcome::Existing(existing.clone())),
        };
        state
            .idempotency
            .insert(request.key.clone(), record.clone());
        Ok(ClaimOutcome::Claimed(record))
    }

    async fn mark_completed(
        &self,
        key: &str,
        response: &serde_json::Value,
        run_id: Option<&str>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .idempotency
            .get_mut(key)
            .ok_or_else(|| CoreError::IdempotencyRecordNotFound {
                key: key.to_string(),
            })?;
        record.status = IdempotencyStatus::Completed;
        record.response = Some(response.clone());
        record.run_id = run_id.map(str::to_string);
        record.error = None;
        record.expires_at = expires_at;
        record.lock_expires_at = None;
        record.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &str,
        error: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .idempotency
            .get_mut(key)
            .ok_or_else(|| CoreError::IdempotencyRecordNotFound {
                key: key.to_string(),
            })?;
        record.status = IdempotencyStatus::Failed;
        record.error = Some(error.to_string());
        record.expires_at = expires_at;
        record.lock_expires_at = None;
        record.updated_at = now;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, CoreError> {
        Ok(self.state.lock().await.idempotency.get(key).cloned())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| record.expires_at > now);
        Ok((before - state.idempotency.len()) as u64)
    }
}
