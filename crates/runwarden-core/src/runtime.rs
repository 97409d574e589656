// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runwarden-core.
//!
//! [`EngineRuntime`] wires the engine services over one persistence backend.
//! It is the only place services are constructed; everything else receives
//! them by injection.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runwarden_core::persistence::SqlitePersistence;
//! use runwarden_core::recovery::RecoveryOptions;
//! use runwarden_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/runwarden.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .owner_id("instance-a")
//!         .build()?;
//!
//!     runtime.run_startup_recovery(&RecoveryOptions::default()).await?;
//!     runtime.start_idempotency_sweep(std::time::Duration::from_secs(300));
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cancellation::{CancellationContext, create_cancellation_context};
use crate::checkpoint::ResumeService;
use crate::heartbeat::{HeartbeatConfig, HeartbeatService};
use crate::idempotency::{IdempotencyConfig, IdempotencyService};
use crate::persistence::{CheckpointStore, IdempotencyStore, Persistence, RunStore};
use crate::recovery::{RecoveryOptions, RecoveryOrchestrator, RecoveryReport};
use crate::run_manager::RunManager;

struct Stores {
    runs: Arc<dyn RunStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    idempotency: Arc<dyn IdempotencyStore>,
}

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    stores: Option<Stores>,
    heartbeat: HeartbeatConfig,
    idempotency: IdempotencyConfig,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.stores.as_ref().map(|_| "..."))
            .field("heartbeat", &self.heartbeat)
            .field("idempotency", &self.idempotency)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence<P: Persistence + 'static>(mut self, persistence: Arc<P>) -> Self {
        self.stores = Some(Stores {
            runs: persistence.clone(),
            checkpoints: persistence.clone(),
            idempotency: persistence,
        });
        self
    }

    /// Set this instance's identity. Default: `instance-{uuid}`.
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.heartbeat.owner_id = Some(owner_id.into());
        self
    }

    /// Set the heartbeat interval. Default: 30s.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat.interval = interval;
        self
    }

    /// Replace the idempotency configuration.
    pub fn idempotency_config(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency = config;
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntime> {
        let stores = self
            .stores
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        if self.heartbeat.interval.is_zero() {
            anyhow::bail!("heartbeat interval must be greater than zero");
        }

        let runs = RunManager::new(stores.runs);
        let resume = ResumeService::new(stores.checkpoints);
        let idempotency = IdempotencyService::with_config(stores.idempotency, self.idempotency);
        let heartbeat = HeartbeatService::new(runs.clone(), self.heartbeat);
        let recovery = RecoveryOrchestrator::new(runs.clone(), resume.clone(), heartbeat.clone());

        info!(owner_id = %heartbeat.owner_id(), "EngineRuntime built");

        Ok(EngineRuntime {
            runs,
            resume,
            idempotency,
            heartbeat,
            recovery,
            shutdown: CancellationToken::new(),
            sweep: Mutex::new(None),
        })
    }
}

/// Result of [`EngineRuntime::run_startup_recovery`].
#[derive(Debug, Clone)]
pub struct StartupRecovery {
    /// Runs this identity already owned whose heartbeats were restarted.
    pub reattached: Vec<String>,
    /// The orphan recovery pass.
    pub report: RecoveryReport,
}

/// A wired engine instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    runs: RunManager,
    resume: ResumeService,
    idempotency: IdempotencyService,
    heartbeat: HeartbeatService,
    recovery: RecoveryOrchestrator,
    shutdown: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// This instance's identity.
    pub fn owner_id(&self) -> &str {
        self.heartbeat.owner_id()
    }

    /// Run lifecycle manager.
    pub fn runs(&self) -> &RunManager {
        &self.runs
    }

    /// Checkpoint log and resume planning.
    pub fn resume(&self) -> &ResumeService {
        &self.resume
    }

    /// Trigger deduplication.
    pub fn idempotency(&self) -> &IdempotencyService {
        &self.idempotency
    }

    /// Heartbeats for owned runs.
    pub fn heartbeat(&self) -> &HeartbeatService {
        &self.heartbeat
    }

    /// Orphan recovery.
    pub fn recovery(&self) -> &RecoveryOrchestrator {
        &self.recovery
    }

    /// Fresh cancellation context for a run about to execute.
    pub fn cancellation_context(&self, run_id: &str, tenant_id: &str) -> CancellationContext {
        create_cancellation_context(run_id, tenant_id)
    }

    /// Reattach runs this identity owns, then recover orphans.
    pub async fn run_startup_recovery(
        &self,
        options: &RecoveryOptions,
    ) -> crate::error::Result<StartupRecovery> {
        let reattached = self.recovery.reattach_owned_runs().await?;
        let report = self.recovery.recover_orphaned_runs(options).await?;
        Ok(StartupRecovery { reattached, report })
    }

    /// Start the periodic idempotency sweep. Later calls are no-ops.
    pub fn start_idempotency_sweep(&self, interval: Duration) {
        let mut sweep = self.sweep.lock().unwrap_or_else(PoisonError::into_inner);
        if sweep.is_some() {
            return;
        }
        *sweep = Some(
            self.idempotency
                .spawn_cleanup(interval, self.shutdown.child_token()),
        );
        info!(interval_secs = interval.as_secs(), "Idempotency sweep started");
    }

    /// Whether the idempotency sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Gracefully shut down: stop the sweep and every heartbeat.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");
        self.shutdown.cancel();

        let sweep = self
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweep
            && let Err(e) = handle.await
        {
            error!("Idempotency sweep task panicked: {}", e);
            return Err(anyhow::anyhow!("sweep task panicked: {}", e));
        }

        self.recovery.shutdown().await;
        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}
