// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for runwarden-core.
//!
//! The engine talks to three narrow store traits. Both backends implement all
//! three over the same contract:
//!
//! - [`InMemoryPersistence`]: map-backed, for tests and embedding
//! - [`SqlitePersistence`]: durable, sqlx with embedded migrations

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationReason;
use crate::compensation::CompensationResult;
use crate::error::CoreError;
use crate::idempotency::TriggerSource;
use crate::state_machine::RunStatus;

// ============================================================================
// Runs
// ============================================================================

/// The trigger a run was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    /// Trigger source.
    pub source: TriggerSource,
    /// Source-specific correlation id (delivery id, request id, ...).
    pub correlation_id: String,
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Skipped (e.g. already completed before a resume).
    Skipped,
}

/// Token and cost accounting for a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepUsage {
    /// Prompt tokens consumed.
    pub tokens_in: u64,
    /// Completion tokens produced.
    pub tokens_out: u64,
    /// Cost in USD.
    pub cost_usd: f64,
}

/// One executed phase of a run (e.g. "triage", "plan").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    /// Step id, unique within the run.
    pub id: String,
    /// Agent that executed the step.
    pub agent: String,
    /// Current status.
    pub status: StepStatus,
    /// When the step started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Token/cost usage.
    pub usage: Option<StepUsage>,
    /// Error message, if failed.
    pub error: Option<String>,
}

impl RunStep {
    /// A step that has just started.
    pub fn started(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            status: StepStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            usage: None,
            error: None,
        }
    }

    /// Mark the step finished with `status`, filling in timing.
    pub fn finish(mut self, status: StepStatus, error: Option<String>) -> Self {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = self.started_at.map(|s| (now - s).num_milliseconds());
        self.error = error;
        self
    }
}

/// Run record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique identifier for the run.
    pub id: String,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: String,
    /// Workflow type (e.g. "issue_fix").
    pub run_type: String,
    /// Current status.
    pub status: RunStatus,
    /// Steps executed so far, in order.
    pub steps: Vec<RunStep>,
    /// Trigger that created the run.
    pub trigger: Option<TriggerDescriptor>,
    /// Idempotency key the run was created under.
    pub idempotency_key: Option<String>,
    /// Engine instance currently responsible for the run.
    pub owner_id: Option<String>,
    /// Last liveness write by the owner.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Number of times the run was resumed.
    pub resume_count: i32,
    /// Ownership generation; bumped on every takeover.
    pub lease_epoch: i64,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Total duration once terminal.
    pub duration_ms: Option<i64>,
    /// Failure message.
    pub error: Option<String>,
    /// Cancellation record, if cancelled.
    pub cancellation: Option<CancellationReason>,
    /// Results of rollback actions.
    pub compensation_log: Vec<CompensationResult>,
}

/// Input for creating a run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    /// Explicit id; a UUID is generated when absent.
    pub id: Option<String>,
    /// Tenant.
    pub tenant_id: String,
    /// Workflow type.
    pub run_type: String,
    /// Trigger descriptor.
    pub trigger: Option<TriggerDescriptor>,
    /// Idempotency key it was created under.
    pub idempotency_key: Option<String>,
    /// Initial owner.
    pub owner_id: Option<String>,
}

impl RunRecord {
    /// Build a `pending` record from creation input.
    pub fn new(input: NewRun, now: DateTime<Utc>) -> Self {
        Self {
            id: input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            tenant_id: input.tenant_id,
            run_type: input.run_type,
            status: RunStatus::Pending,
            steps: Vec::new(),
            trigger: input.trigger,
            idempotency_key: input.idempotency_key,
            owner_id: input.owner_id,
            last_heartbeat_at: None,
            resume_count: 0,
            lease_epoch: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            duration_ms: None,
            error: None,
            cancellation: None,
            compensation_log: Vec::new(),
        }
    }

    /// Last proof of life: the heartbeat, or the last update if never heartbeated.
    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at.unwrap_or(self.updated_at)
    }
}

/// Partial update applied by [`RunStore::update_run`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    /// New status (callers must validate through the state machine first).
    pub status: Option<RunStatus>,
    /// Replacement step list.
    pub steps: Option<Vec<RunStep>>,
    /// New owner.
    pub owner_id: Option<String>,
    /// New heartbeat time.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// New resume count.
    pub resume_count: Option<i32>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration.
    pub duration_ms: Option<i64>,
    /// Error message.
    pub error: Option<String>,
    /// Cancellation record.
    pub cancellation: Option<CancellationReason>,
    /// Compensation log.
    pub compensation_log: Option<Vec<CompensationResult>>,
}

impl RunPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == RunPatch::default()
    }

    /// Apply the patch in place, bumping `updated_at`.
    pub fn apply(&self, run: &mut RunRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(steps) = &self.steps {
            run.steps = steps.clone();
        }
        if let Some(owner_id) = &self.owner_id {
            run.owner_id = Some(owner_id.clone());
        }
        if let Some(at) = self.last_heartbeat_at {
            run.last_heartbeat_at = Some(at);
        }
        if let Some(count) = self.resume_count {
            run.resume_count = count;
        }
        if let Some(at) = self.completed_at {
            run.completed_at = Some(at);
        }
        if let Some(ms) = self.duration_ms {
            run.duration_ms = Some(ms);
        }
        if let Some(error) = &self.error {
            run.error = Some(error.clone());
        }
        if let Some(cancellation) = &self.cancellation {
            run.cancellation = Some(cancellation.clone());
        }
        if let Some(log) = &self.compensation_log {
            run.compensation_log = log.clone();
        }
        run.updated_at = now;
    }
}

/// Filter options for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Only runs of this tenant.
    pub tenant_id: Option<String>,
    /// Only runs in one of these statuses (empty = any).
    pub statuses: Vec<RunStatus>,
    /// Only runs owned by this instance.
    pub owner_id: Option<String>,
    /// Only runs last seen (heartbeat, else update) strictly before this time.
    pub last_seen_before: Option<DateTime<Utc>>,
    /// Maximum number of runs, oldest first.
    pub limit: Option<i64>,
}

impl RunFilter {
    /// Whether `run` satisfies every set criterion (limit excluded).
    pub fn matches(&self, run: &RunRecord) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| *t == run.tenant_id)
            && (self.statuses.is_empty() || self.statuses.contains(&run.status))
            && self
                .owner_id
                .as_ref()
                .is_none_or(|o| run.owner_id.as_ref() == Some(o))
            && self
                .last_seen_before
                .is_none_or(|cutoff| run.last_seen_at() < cutoff)
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Outcome recorded by a step checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// The step attempt finished successfully.
    Completed,
    /// The step attempt failed.
    Failed,
    /// The step was skipped.
    Skipped,
}

impl CheckpointStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse a status from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(CoreError::validation(
                "checkpoint_status",
                format!("unknown checkpoint status '{other}'"),
            )),
        }
    }
}

/// Immutable snapshot emitted after a step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    /// Step the attempt belongs to.
    pub step_id: String,
    /// Agent that ran it.
    pub agent: String,
    /// Outcome.
    pub status: CheckpointStatus,
    /// Opaque step input.
    pub input: Option<serde_json::Value>,
    /// Opaque step output.
    pub output: Option<serde_json::Value>,
    /// Safe to treat as a resume point.
    pub resumable: bool,
    /// Safe to re-execute blindly.
    pub idempotent: bool,
    /// Failure message.
    pub error: Option<String>,
    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,
}

impl StepCheckpoint {
    /// A resumable, non-idempotent checkpoint for a completed step.
    pub fn completed(
        step_id: impl Into<String>,
        agent: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent: agent.into(),
            status: CheckpointStatus::Completed,
            input: None,
            output: Some(output),
            resumable: true,
            idempotent: false,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A non-resumable checkpoint for a failed step.
    pub fn failed(
        step_id: impl Into<String>,
        agent: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent: agent.into(),
            status: CheckpointStatus::Failed,
            input: None,
            output: None,
            resumable: false,
            idempotent: false,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Attach the step input.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Override the resumable flag.
    pub fn resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    /// Override the idempotent flag.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// Idempotency
// ============================================================================

/// Processing state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// An instance claimed the key and is working on it.
    Processing,
    /// Finished; the cached response is authoritative.
    Completed,
    /// Failed; the key may be claimed again.
    Failed,
}

impl IdempotencyStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::validation(
                "idempotency_status",
                format!("unknown idempotency status '{other}'"),
            )),
        }
    }
}

/// Idempotency record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Source-specific composite key.
    pub key: String,
    /// Trigger source.
    pub source: TriggerSource,
    /// Tenant that first claimed the key.
    pub tenant_id: String,
    /// Current state.
    pub status: IdempotencyStatus,
    /// SHA-256 of the request payload.
    pub request_hash: String,
    /// Cached response once completed.
    pub response: Option<serde_json::Value>,
    /// Run created for the trigger.
    pub run_id: Option<String>,
    /// Failure message once failed.
    pub error: Option<String>,
    /// Number of claims (first claim = 1).
    pub attempts: i32,
    /// First claim.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// When the record may be swept.
    pub expires_at: DateTime<Utc>,
    /// When a `processing` claim is considered abandoned.
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// Whether a new claim may take over this record at `now`.
    ///
    /// Failed records permit retry, expired records are stale, and a processing
    /// record is only reclaimable once its lock has lapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            IdempotencyStatus::Failed => true,
            _ if self.expires_at <= now => true,
            IdempotencyStatus::Processing => self.lock_expires_at.is_some_and(|lock| lock <= now),
            IdempotencyStatus::Completed => false,
        }
    }
}

/// Parameters for an atomic claim of an idempotency key.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Key to claim.
    pub key: String,
    /// Trigger source.
    pub source: TriggerSource,
    /// Claiming tenant.
    pub tenant_id: String,
    /// Hash of the request payload.
    pub request_hash: String,
    /// Current time.
    pub now: DateTime<Utc>,
    /// When the processing lock lapses.
    pub lock_expires_at: DateTime<Utc>,
    /// When the processing record may be swept.
    pub expires_at: DateTime<Utc>,
}

impl ClaimRequest {
    /// The record a successful first claim creates.
    pub fn to_record(&self) -> IdempotencyRecord {
        IdempotencyRecord {
            key: self.key.clone(),
            source: self.source,
            tenant_id: self.tenant_id.clone(),
            status: IdempotencyStatus::Processing,
            request_hash: self.request_hash.clone(),
            response: None,
            run_id: None,
            error: None,
            attempts: 1,
            created_at: self.now,
            updated_at: self.now,
            expires_at: self.expires_at,
            lock_expires_at: Some(self.lock_expires_at),
        }
    }

    /// Whether this request may take over `existing`: same tenant, and the
    /// record is claimable at `now`.
    pub fn can_reclaim(&self, existing: &IdempotencyRecord) -> bool {
        existing.tenant_id == self.tenant_id && existing.is_claimable(self.now)
    }

    /// Take over an existing claimable record.
    pub fn reclaim(&self, existing: &IdempotencyRecord) -> IdempotencyRecord {
        IdempotencyRecord {
            attempts: existing.attempts + 1,
            created_at: existing.created_at,
            ..self.to_record()
        }
    }
}

/// Result of an atomic check-and-set.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the key.
    Claimed(IdempotencyRecord),
    /// Another claim holds the key; the record is returned unchanged.
    Existing(IdempotencyRecord),
}

// ============================================================================
// Store traits
// ============================================================================

/// Run storage used by every component.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run. Fails with `RunAlreadyExists` on id collision.
    async fn create_run(&self, run: &RunRecord) -> Result<(), CoreError>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError>;

    /// Apply a patch and return the updated run. Fails with `RunNotFound`.
    async fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<RunRecord, CoreError>;

    /// List runs matching a filter, oldest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, CoreError>;

    /// Count non-terminal runs, optionally for one tenant.
    async fn count_in_flight_runs(&self, tenant_id: Option<&str>) -> Result<i64, CoreError>;

    /// Write a heartbeat if `owner_id` still holds the lease at `lease_epoch`.
    ///
    /// Succeeds only when the run is running or paused, its epoch equals
    /// `lease_epoch`, and it is unowned or owned by `owner_id`. Sets the owner
    /// and heartbeat time. Returns `false` when the lease is not held.
    async fn record_heartbeat(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_epoch: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Take over a non-terminal run if its epoch still equals `expected_epoch`.
    ///
    /// With `stale_before`, the run must also not have been seen (heartbeat,
    /// or last update if never heartbeated) since that instant, so an owner
    /// that heartbeated after a scan keeps its run. On success the owner
    /// becomes `new_owner`, the epoch is incremented, and the heartbeat is
    /// refreshed. Returns `None` if the condition no longer holds.
    async fn reassign_owner(
        &self,
        run_id: &str,
        expected_epoch: i64,
        stale_before: Option<DateTime<Utc>>,
        new_owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError>;
}

/// Append-only checkpoint log per run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint.
    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), CoreError>;

    /// All checkpoints of a run ordered by timestamp, then write order.
    async fn get_checkpoints(&self, run_id: &str) -> Result<Vec<StepCheckpoint>, CoreError>;

    /// The most recent checkpoint.
    async fn get_latest_checkpoint(
        &self,
        run_id: &str,
    ) -> Result<Option<StepCheckpoint>, CoreError>;

    /// Remove every checkpoint of a run; returns how many were removed.
    async fn clear_checkpoints(&self, run_id: &str) -> Result<u64, CoreError>;

    /// Whether any checkpoint exists.
    async fn has_checkpoints(&self, run_id: &str) -> Result<bool, CoreError>;
}

/// Idempotency record storage with an atomic check-and-set.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim `request.key`, or return the record holding it.
    async fn check_and_set(&self, request: &ClaimRequest) -> Result<ClaimOutcome, CoreError>;

    /// Mark a key completed with its cached response.
    async fn mark_completed(
        &self,
        key: &str,
        response: &serde_json::Value,
        run_id: Option<&str>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Mark a key failed so it can be retried.
    async fn mark_failed(
        &self,
        key: &str,
        error: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Fetch a record.
    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, CoreError>;

    /// Delete records whose `expires_at` has passed; returns how many.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, CoreError>;
}

/// A backend implementing all three stores.
pub trait Persistence: RunStore + CheckpointStore + IdempotencyStore {}

impl<T: RunStore + CheckpointStore + IdempotencyStore> Persistence for T {}
