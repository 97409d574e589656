// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Timestamps are stored as unix epoch milliseconds and structured fields
//! (steps, trigger, cancellation, compensation log, checkpoint payloads) as
//! JSON text. Every conditional write is a single statement, so the lease and
//! idempotency compare-and-swaps are atomic across connections and processes.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::CoreError;
use crate::migrations::SQLITE as MIGRATOR;
use crate::state_machine::RunStatus;

use super::{
    CheckpointStatus, CheckpointStore, ClaimOutcome, ClaimRequest, IdempotencyRecord,
    IdempotencyStatus, IdempotencyStore, RunFilter, RunPatch, RunRecord, RunStore,
    StepCheckpoint,
};

const RUN_COLUMNS: &str = "id, tenant_id, run_type, status, steps, trigger_json, \
    idempotency_key, owner_id, last_heartbeat_at, resume_count, lease_epoch, created_at, \
    updated_at, completed_at, duration_ms, error, cancellation, compensation_log";

const CHECKPOINT_COLUMNS: &str =
    "step_id, agent, status, input, output, resumable, idempotent, error, timestamp";

const IDEMPOTENCY_COLUMNS: &str = "idempotency_key, source, tenant_id, status, request_hash, \
    response, run_id, error, attempts, created_at, updated_at, expires_at, lock_expires_at";

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

const LEASED_STATUSES: &str = "('running', 'awaiting_approval', 'waiting_external')";

/// How often a claim is retried when the conflicting record disappears between
/// the upsert and the follow-up read.
const CLAIM_ATTEMPTS: usize = 3;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL and run migrations.
    ///
    /// In-memory databases are pinned to a single connection so every query
    /// sees the same schema.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL '{}': {}", url, e),
            })?
            .create_if_missing(true);

        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at '{}': {}", url, e),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a SQLite database at a file path.
    ///
    /// Creates parent directories and the file itself when missing, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/runwarden.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoreError::Serialization(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, CoreError> {
    ms.map(from_millis).transpose()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, CoreError> {
    Ok(serde_json::from_str(text)?)
}

fn opt_from_json<T: DeserializeOwned>(text: Option<String>) -> Result<Option<T>, CoreError> {
    text.as_deref().map(from_json).transpose()
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    tenant_id: String,
    run_type: String,
    status: String,
    steps: String,
    trigger_json: Option<String>,
    idempotency_key: Option<String>,
    owner_id: Option<String>,
    last_heartbeat_at: Option<i64>,
    resume_count: i64,
    lease_epoch: i64,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    duration_ms: Option<i64>,
    error: Option<String>,
    cancellation: Option<String>,
    compensation_log: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(RunRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            run_type: row.run_type,
            status: row.status.parse()?,
            steps: from_json(&row.steps)?,
            trigger: opt_from_json(row.trigger_json)?,
            idempotency_key: row.idempotency_key,
            owner_id: row.owner_id,
            last_heartbeat_at: opt_from_millis(row.last_heartbeat_at)?,
            resume_count: row.resume_count as i32,
            lease_epoch: row.lease_epoch,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            completed_at: opt_from_millis(row.completed_at)?,
            duration_ms: row.duration_ms,
            error: row.error,
            cancellation: opt_from_json(row.cancellation)?,
            compensation_log: from_json(&row.compensation_log)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    step_id: String,
    agent: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    resumable: i64,
    idempotent: i64,
    error: Option<String>,
    timestamp: i64,
}

impl TryFrom<CheckpointRow> for StepCheckpoint {
    type Error = CoreError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(StepCheckpoint {
            step_id: row.step_id,
            agent: row.agent,
            status: CheckpointStatus::parse(&row.status)?,
            input: opt_from_json(row.input)?,
            output: opt_from_json(row.output)?,
            resumable: row.resumable != 0,
            idempotent: row.idempotent != 0,
            error: row.error,
            timestamp: from_millis(row.timestamp)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    idempotency_key: String,
    source: String,
    tenant_id: String,
    status: String,
    request_hash: String,
    response: Option<String>,
    run_id: Option<String>,
    error: Option<String>,
    attempts: i64,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
    lock_expires_at: Option<i64>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = CoreError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        Ok(IdempotencyRecord {
            key: row.idempotency_key,
            source: row.source.parse()?,
            tenant_id: row.tenant_id,
            status: IdempotencyStatus::parse(&row.status)?,
            request_hash: row.request_hash,
            response: opt_from_json(row.response)?,
            run_id: row.run_id,
            error: row.error,
            attempts: row.attempts as i32,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            expires_at: from_millis(row.expires_at)?,
            lock_expires_at: opt_from_millis(row.lock_expires_at)?,
        })
    }
}

// ============================================================================
// RunStore
// ============================================================================

#[async_trait]
impl RunStore for SqlitePersistence {
    async fn create_run(&self, run: &RunRecord) -> Result<(), CoreError> {
        let sql = format!(
            "INSERT INTO runs ({RUN_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let trigger = run.trigger.as_ref().map(to_json).transpose()?;
        let cancellation = run.cancellation.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(&sql)
            .bind(&run.id)
            .bind(&run.tenant_id)
            .bind(&run.run_type)
            .bind(run.status.as_str())
            .bind(to_json(&run.steps)?)
            .bind(trigger)
            .bind(&run.idempotency_key)
            .bind(&run.owner_id)
            .bind(run.last_heartbeat_at.map(millis))
            .bind(run.resume_count as i64)
            .bind(run.lease_epoch)
            .bind(millis(run.created_at))
            .bind(millis(run.updated_at))
            .bind(run.completed_at.map(millis))
            .bind(run.duration_ms)
            .bind(&run.error)
            .bind(cancellation)
            .bind(to_json(&run.compensation_log)?)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CoreError::RunAlreadyExists {
                    run_id: run.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?");
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<RunRecord, CoreError> {
        let sql = format!(
            r#"
            UPDATE runs SET
                status = COALESCE(?, status),
                steps = COALESCE(?, steps),
                owner_id = COALESCE(?, owner_id),
                last_heartbeat_at = COALESCE(?, last_heartbeat_at),
                resume_count = COALESCE(?, resume_count),
                completed_at = COALESCE(?, completed_at),
                duration_ms = COALESCE(?, duration_ms),
                error = COALESCE(?, error),
                cancellation = COALESCE(?, cancellation),
                compensation_log = COALESCE(?, compensation_log),
                updated_at = ?
            WHERE id = ?
            RETURNING {RUN_COLUMNS}
            "#
        );

        let steps = patch.steps.as_ref().map(to_json).transpose()?;
        let cancellation = patch.cancellation.as_ref().map(to_json).transpose()?;
        let compensation_log = patch.compensation_log.as_ref().map(to_json).transpose()?;

        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(steps)
            .bind(&patch.owner_id)
            .bind(patch.last_heartbeat_at.map(millis))
            .bind(patch.resume_count.map(i64::from))
            .bind(patch.completed_at.map(millis))
            .bind(patch.duration_ms)
            .bind(&patch.error)
            .bind(cancellation)
            .bind(compensation_log)
            .bind(millis(Utc::now()))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(CoreError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, CoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1"));

        if let Some(tenant_id) = &filter.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id.clone());
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(owner_id) = &filter.owner_id {
            qb.push(" AND owner_id = ").push_bind(owner_id.clone());
        }
        if let Some(cutoff) = filter.last_seen_before {
            qb.push(" AND COALESCE(last_heartbeat_at, updated_at) < ")
                .push_bind(millis(cutoff));
        }
        qb.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb
            .build_query_as::<RunRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn count_in_flight_runs(&self, tenant_id: Option<&str>) -> Result<i64, CoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM runs \
             WHERE status NOT IN {TERMINAL_STATUSES} AND (? IS NULL OR tenant_id = ?)"
        );
        let count: (i64,) = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }

    async fn record_heartbeat(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_epoch: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let sql = format!(
            r#"
            UPDATE runs
            SET owner_id = ?, last_heartbeat_at = ?
            WHERE id = ?
              AND lease_epoch = ?
              AND (owner_id IS NULL OR owner_id = ?)
              AND status IN {LEASED_STATUSES}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(owner_id)
            .bind(millis(at))
            .bind(run_id)
            .bind(lease_epoch)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reassign_owner(
        &self,
        run_id: &str,
        expected_epoch: i64,
        stale_before: Option<DateTime<Utc>>,
        new_owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!(
            r#"
            UPDATE runs
            SET owner_id = ?, lease_epoch = lease_epoch + 1,
                last_heartbeat_at = ?, updated_at = ?
            WHERE id = ? AND lease_epoch = ? AND status NOT IN {TERMINAL_STATUSES}
              AND (? IS NULL OR COALESCE(last_heartbeat_at, updated_at) < ?)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let cutoff = stale_before.map(millis);
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(new_owner)
            .bind(millis(at))
            .bind(millis(at))
            .bind(run_id)
            .bind(expected_epoch)
            .bind(cutoff)
            .bind(cutoff)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRecord::try_from).transpose()
    }
}

// ============================================================================
// CheckpointStore
// ============================================================================

#[async_trait]
impl CheckpointStore for SqlitePersistence {
    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), CoreError> {
        let input = checkpoint.input.as_ref().map(to_json).transpose()?;
        let output = checkpoint.output.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO run_checkpoints
                (run_id, step_id, agent, status, input, output, resumable, idempotent, error, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(&checkpoint.step_id)
        .bind(&checkpoint.agent)
        .bind(checkpoint.status.as_str())
        .bind(input)
        .bind(output)
        .bind(checkpoint.resumable as i64)
        .bind(checkpoint.idempotent as i64)
        .bind(&checkpoint.error)
        .bind(millis(checkpoint.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_checkpoints(&self, run_id: &str) -> Result<Vec<StepCheckpoint>, CoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM run_checkpoints \
             WHERE run_id = ? ORDER BY timestamp ASC, seq ASC"
        );
        let rows = sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StepCheckpoint::try_from).collect()
    }

    async fn get_latest_checkpoint(
        &self,
        run_id: &str,
    ) -> Result<Option<StepCheckpoint>, CoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM run_checkpoints \
             WHERE run_id = ? ORDER BY timestamp DESC, seq DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, CheckpointRow>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(StepCheckpoint::try_from).transpose()
    }

    async fn clear_checkpoints(&self, run_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM run_checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn has_checkpoints(&self, run_id: &str) -> Result<bool, CoreError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM run_checkpoints WHERE run_id = ?)",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0 != 0)
    }
}

// ============================================================================
// IdempotencyStore
// ============================================================================

#[async_trait]
impl IdempotencyStore for SqlitePersistence {
    async fn check_and_set(&self, request: &ClaimRequest) -> Result<ClaimOutcome, CoreError> {
        // Insert, or take over a record of the same tenant that is failed,
        // expired, or holds a lapsed processing lock. RETURNING yields a row
        // only when we won.
        let sql = format!(
            r#"
            INSERT INTO idempotency_records
                (idempotency_key, source, tenant_id, status, request_hash, attempts,
                 created_at, updated_at, expires_at, lock_expires_at)
            VALUES (?, ?, ?, 'processing', ?, 1, ?, ?, ?, ?)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                source = excluded.source,
                status = 'processing',
                request_hash = excluded.request_hash,
                response = NULL,
                run_id = NULL,
                error = NULL,
                attempts = idempotency_records.attempts + 1,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at,
                lock_expires_at = excluded.lock_expires_at
            WHERE idempotency_records.tenant_id = excluded.tenant_id
              AND (idempotency_records.status = 'failed'
                   OR idempotency_records.expires_at <= excluded.updated_at
                   OR (idempotency_records.status = 'processing'
                       AND idempotency_records.lock_expires_at <= excluded.updated_at))
            RETURNING {IDEMPOTENCY_COLUMNS}
            "#
        );

        for attempt in 1..=CLAIM_ATTEMPTS {
            let claimed = sqlx::query_as::<_, IdempotencyRow>(&sql)
                .bind(&request.key)
                .bind(request.source.as_str())
                .bind(&request.tenant_id)
                .bind(&request.request_hash)
                .bind(millis(request.now))
                .bind(millis(request.now))
                .bind(millis(request.expires_at))
                .bind(millis(request.lock_expires_at))
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = claimed {
                return Ok(ClaimOutcome::Claimed(row.try_into()?));
            }
            if let Some(existing) = self.get_record(&request.key).await? {
                return Ok(ClaimOutcome::Existing(existing));
            }
            debug!(key = %request.key, attempt, "Idempotency record vanished mid-claim, retrying");
        }

        Err(CoreError::DatabaseError {
            operation: "check_and_set".to_string(),
            details: format!(
                "record '{}' changed concurrently on every attempt",
                request.key
            ),
        })
    }

    async fn mark_completed(
        &self,
        key: &str,
        response: &serde_json::Value,
        run_id: Option<&str>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'completed', response = ?, run_id = ?, error = NULL,
                expires_at = ?, lock_expires_at = NULL, updated_at = ?
            WHERE idempotency_key = ?
            "#,
        )
        .bind(to_json(response)?)
        .bind(run_id)
        .bind(millis(expires_at))
        .bind(millis(now))
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::IdempotencyRecordNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &str,
        error: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'failed', error = ?, expires_at = ?,
                lock_expires_at = NULL, updated_at = ?
            WHERE idempotency_key = ?
            "#,
        )
        .bind(error)
        .bind(millis(expires_at))
        .bind(millis(now))
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::IdempotencyRecordNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, CoreError> {
        let sql = format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_records WHERE idempotency_key = ?"
        );
        let row = sqlx::query_as::<_, IdempotencyRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= ?")
            .bind(millis(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationReason;
    use crate::idempotency::TriggerSource;
    use crate::persistence::{NewRun, RunStep, StepStatus, TriggerDescriptor};
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    /// Current time truncated to the stored precision.
    fn now_ms() -> DateTime<Utc> {
        from_millis(millis(Utc::now())).unwrap()
    }

    fn new_run(status: RunStatus) -> RunRecord {
        let mut run = RunRecord::new(
            NewRun {
                tenant_id: "test-tenant".to_string(),
                run_type: "issue_fix".to_string(),
                trigger: Some(TriggerDescriptor {
                    source: TriggerSource::Webhook,
                    correlation_id: Uuid::new_v4().to_string(),
                }),
                ..Default::default()
            },
            now_ms(),
        );
        run.status = status;
        run
    }

    fn claim(key: &str, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            key: key.to_string(),
            source: TriggerSource::Api,
            tenant_id: "test-tenant".to_string(),
            request_hash: "hash-1".to_string(),
            now,
            lock_expires_at: now + Duration::minutes(5),
            expires_at: now + Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = new_run(RunStatus::Pending);

        persistence.create_run(&run).await.expect("create");
        let loaded = persistence
            .get_run(&run.id)
            .await
            .expect("get")
            .expect("run should exist");

        assert_eq!(loaded, run);
        assert!(persistence.get_run("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_run() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = new_run(RunStatus::Pending);

        persistence.create_run(&run).await.unwrap();
        let err = persistence.create_run(&run).await.unwrap_err();
        assert!(matches!(err, CoreError::RunAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_run_applies_only_set_fields() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = new_run(RunStatus::Running);
        persistence.create_run(&run).await.unwrap();

        let step = RunStep::started("triage", "triager").finish(StepStatus::Completed, None);
        let updated = persistence
            .update_run(
                &run.id,
                &RunPatch {
                    steps: Some(vec![step.clone()]),
                    cancellation: Some(CancellationReason::by_user("u1", "stop")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(updated.steps.len(), 1);
        assert_eq!(updated.steps[0].id, "triage");
        assert_eq!(
            updated.cancellation.as_ref().and_then(|c| c.user_id.as_deref()),
            Some("u1")
        );
        assert_eq!(updated.trigger, run.trigger);

        let err = persistence
            .update_run("missing", &RunPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_runs_filters() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = now_ms();

        let mut stale = new_run(RunStatus::Running);
        stale.last_heartbeat_at = Some(now - Duration::minutes(10));
        let mut fresh = new_run(RunStatus::Running);
        fresh.last_heartbeat_at = Some(now);
        let done = new_run(RunStatus::Completed);

        for run in [&stale, &fresh, &done] {
            persistence.create_run(run).await.unwrap();
        }

        let orphans = persistence
            .list_runs(&RunFilter {
                statuses: vec![RunStatus::Running],
                last_seen_before: Some(now - Duration::minutes(5)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, stale.id);

        assert_eq!(persistence.count_in_flight_runs(None).await.unwrap(), 2);
        assert_eq!(
            persistence
                .count_in_flight_runs(Some("other-tenant"))
                .await
                .unwrap(),
            0
        );

        let limited = persistence
            .list_runs(&RunFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_epoch_fencing() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = new_run(RunStatus::Running);
        persistence.create_run(&run).await.unwrap();
        let now = now_ms();

        assert!(persistence.record_heartbeat(&run.id, "a", 0, now).await.unwrap());
        assert!(!persistence.record_heartbeat(&run.id, "b", 0, now).await.unwrap());

        let taken = persistence
            .reassign_owner(&run.id, 0, None, "b", now)
            .await
            .unwrap()
            .expect("takeover should win");
        assert_eq!(taken.lease_epoch, 1);
        assert_eq!(taken.owner_id.as_deref(), Some("b"));

        assert!(!persistence.record_heartbeat(&run.id, "a", 0, now).await.unwrap());
        assert!(persistence.record_heartbeat(&run.id, "b", 1, now).await.unwrap());
        assert!(
            persistence
                .reassign_owner(&run.id, 0, None, "c", now)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_takeover_requires_staleness() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = new_run(RunStatus::Running);
        persistence.create_run(&run).await.unwrap();
        let now = now_ms();
        let cutoff = now - Duration::minutes(5);

        assert!(persistence.record_heartbeat(&run.id, "a", 0, now).await.unwrap());
        assert!(
            persistence
                .reassign_owner(&run.id, 0, Some(cutoff), "b", now)
                .await
                .unwrap()
                .is_none()
        );

        let later = now + Duration::minutes(10);
        let taken = persistence
            .reassign_owner(&run.id, 0, Some(later - Duration::minutes(5)), "b", later)
            .await
            .unwrap()
            .expect("stale run should be taken over");
        assert_eq!(taken.owner_id.as_deref(), Some("b"));
        assert_eq!(taken.lease_epoch, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_log() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let base = now_ms();

        let first = StepCheckpoint::completed("triage", "triager", json!({"label": "bug"}))
            .with_input(json!({"issue": 1}))
            .at(base);
        let second = StepCheckpoint::failed("plan", "planner", "timeout")
            .at(base + Duration::seconds(1));

        persistence.save_checkpoint("run-1", &second).await.unwrap();
        persistence.save_checkpoint("run-1", &first).await.unwrap();

        let all = persistence.get_checkpoints("run-1").await.unwrap();
        assert_eq!(all, vec![first, second.clone()]);
        assert_eq!(
            persistence.get_latest_checkpoint("run-1").await.unwrap(),
            Some(second)
        );
        assert!(persistence.has_checkpoints("run-1").await.unwrap());
        assert_eq!(persistence.clear_checkpoints("run-1").await.unwrap(), 2);
        assert!(!persistence.has_checkpoints("run-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_and_set_claims_once() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = now_ms();

        let first = persistence.check_and_set(&claim("api:c:r1", now)).await.unwrap();
        let ClaimOutcome::Claimed(record) = first else {
            panic!("first claim should win");
        };
        assert_eq!(record.attempts, 1);
        assert_eq!(record.status, IdempotencyStatus::Processing);

        let second = persistence.check_and_set(&claim("api:c:r1", now)).await.unwrap();
        assert!(matches!(second, ClaimOutcome::Existing(_)));
    }

    #[tokio::test]
    async fn test_check_and_set_reclaims_failed_and_stale() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = now_ms();

        persistence.check_and_set(&claim("api:c:r2", now)).await.unwrap();
        persistence
            .mark_failed("api:c:r2", "boom", now + Duration::hours(1), now)
            .await
            .unwrap();

        let retry = persistence.check_and_set(&claim("api:c:r2", now)).await.unwrap();
        let ClaimOutcome::Claimed(record) = retry else {
            panic!("failed record should be reclaimable");
        };
        assert_eq!(record.attempts, 2);
        assert_eq!(record.created_at, now);
        assert!(record.error.is_none());

        // Lock still held one minute later, lapsed after six.
        let later = now + Duration::minutes(1);
        assert!(matches!(
            persistence.check_and_set(&claim("api:c:r2", later)).await.unwrap(),
            ClaimOutcome::Existing(_)
        ));
        let stale = now + Duration::minutes(6);
        assert!(matches!(
            persistence.check_and_set(&claim("api:c:r2", stale)).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_check_and_set_keeps_other_tenant_out() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = now_ms();

        persistence.check_and_set(&claim("api:c:r4", now)).await.unwrap();
        persistence
            .mark_failed("api:c:r4", "boom", now + Duration::hours(1), now)
            .await
            .unwrap();

        let intruder = ClaimRequest {
            tenant_id: "other-tenant".to_string(),
            ..claim("api:c:r4", now + Duration::minutes(6))
        };
        let ClaimOutcome::Existing(record) = persistence.check_and_set(&intruder).await.unwrap()
        else {
            panic!("another tenant must not take over the key");
        };
        assert_eq!(record.tenant_id, "test-tenant");
        assert_eq!(record.status, IdempotencyStatus::Failed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_mark_completed_and_cleanup() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = now_ms();

        persistence.check_and_set(&claim("api:c:r3", now)).await.unwrap();
        persistence
            .mark_completed(
                "api:c:r3",
                &json!({"run_id": "run-9"}),
                Some("run-9"),
                now + Duration::hours(24),
                now,
            )
            .await
            .unwrap();

        let record = persistence.get_record("api:c:r3").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.run_id.as_deref(), Some("run-9"));
        assert_eq!(record.response, Some(json!({"run_id": "run-9"})));
        assert!(record.lock_expires_at.is_none());

        let err = persistence
            .mark_completed("missing", &json!({}), None, now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::IdempotencyRecordNotFound { .. }));

        assert_eq!(persistence.cleanup_expired(now).await.unwrap(), 0);
        assert_eq!(
            persistence
                .cleanup_expired(now + Duration::hours(25))
                .await
                .unwrap(),
            1
        );
    }
}
