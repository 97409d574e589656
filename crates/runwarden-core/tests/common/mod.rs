// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runwarden-core integration tests.
//!
//! Every test gets its own SQLite file inside a temp directory so several
//! engine instances can share one store the way separate processes would.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use runwarden_core::persistence::{NewRun, RunRecord, RunStore, SqlitePersistence};
use runwarden_core::runtime::EngineRuntime;
use runwarden_core::state_machine::RunStatus;

/// A SQLite database file that lives as long as the context.
pub struct TestContext {
    pub dir: TempDir,
    pub persistence: Arc<SqlitePersistence>,
}

impl TestContext {
    /// Create a fresh database with migrations applied.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = Arc::new(
            SqlitePersistence::from_path(dir.path().join("runwarden.db"))
                .await
                .expect("Failed to open SQLite database"),
        );
        Self { dir, persistence }
    }

    /// Open a second handle on the same database file, like another process would.
    pub async fn reopen(&self) -> Arc<SqlitePersistence> {
        Arc::new(
            SqlitePersistence::from_path(self.dir.path().join("runwarden.db"))
                .await
                .expect("Failed to reopen SQLite database"),
        )
    }

    /// Build an engine instance with the given identity over this database.
    pub fn runtime(&self, owner_id: &str) -> EngineRuntime {
        runtime_over(self.persistence.clone(), owner_id)
    }
}

/// Build an engine instance over an explicit backend.
pub fn runtime_over(persistence: Arc<SqlitePersistence>, owner_id: &str) -> EngineRuntime {
    EngineRuntime::builder()
        .persistence(persistence)
        .owner_id(owner_id)
        .heartbeat_interval(Duration::from_secs(30))
        .build()
        .expect("Failed to build runtime")
}

/// Insert a `running` run owned by `owner_id` whose last heartbeat is
/// `silent_for` in the past.
pub async fn insert_stale_run(
    store: &dyn RunStore,
    run_id: &str,
    owner_id: &str,
    silent_for: chrono::Duration,
) -> RunRecord {
    let now = Utc::now();
    let mut run = RunRecord::new(
        NewRun {
            id: Some(run_id.to_string()),
            tenant_id: "tenant-1".to_string(),
            run_type: "issue_fix".to_string(),
            owner_id: Some(owner_id.to_string()),
            ..Default::default()
        },
        now - silent_for - chrono::Duration::minutes(1),
    );
    run.status = RunStatus::Running;
    run.last_heartbeat_at = Some(now - silent_for);
    store
        .create_run(&run)
        .await
        .expect("Failed to insert stale run");
    run
}

/// Input for a plain run in the default tenant.
pub fn new_run(run_id: &str) -> NewRun {
    NewRun {
        id: Some(run_id.to_string()),
        tenant_id: "tenant-1".to_string(),
        run_type: "issue_fix".to_string(),
        ..Default::default()
    }
}
