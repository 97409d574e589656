// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run liveness and orphan detection.
//!
//! Each engine instance heartbeats the runs it executes. A heartbeat write is
//! fenced by the run's `lease_epoch`: once another instance takes the run over,
//! the old owner's writes are refused and it stops tracking the run.
//!
//! Runs stuck in `running` whose last proof of life is older than the stale
//! threshold are orphans; [`HeartbeatService::recover_orphaned_runs`] finds
//! them and can fail them outright.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationInitiator;
use crate::error::{CoreError, Result};
use crate::persistence::{RunFilter, RunPatch, RunRecord};
use crate::run_manager::RunManager;
use crate::state_machine::{RunStatus, TransitionContext};

/// Prefix of the error recorded on runs failed as orphans.
pub const ORPHANED_ERROR: &str = "orphaned";

/// Heartbeat service configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Instance identity; generated as `instance-{uuid}` when absent.
    pub owner_id: Option<String>,
    /// Time between heartbeat writes.
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            interval: Duration::from_secs(30),
        }
    }
}

/// Options for an orphan scan.
#[derive(Debug, Clone)]
pub struct OrphanScanOptions {
    /// Runs not seen for longer than this are orphans.
    pub stale_threshold: Duration,
    /// Move every orphan found to `failed`.
    pub fail_orphans: bool,
    /// Upper bound on orphans returned.
    pub max_runs: Option<i64>,
}

impl Default for OrphanScanOptions {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(5 * 60),
            fail_orphans: false,
            max_runs: None,
        }
    }
}

/// Instant before which a run's last proof of life makes it an orphan.
pub(crate) fn stale_cutoff(stale_threshold: Duration) -> Result<DateTime<Utc>> {
    let threshold = chrono::Duration::from_std(stale_threshold)
        .map_err(|e| CoreError::validation("stale_threshold", e.to_string()))?;
    Ok(Utc::now() - threshold)
}

/// Generate a fresh instance identity.
pub fn generate_owner_id() -> String {
    format!("instance-{}", uuid::Uuid::new_v4())
}

struct Tracked {
    generation: u64,
    tenant_id: String,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    owner_id: String,
    interval: Duration,
    runs: RunManager,
    tracked: Mutex<HashMap<String, Tracked>>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
    root: CancellationToken,
}

/// Periodic liveness writer for the runs this instance owns.
#[derive(Clone)]
pub struct HeartbeatService {
    inner: Arc<Inner>,
}

impl HeartbeatService {
    /// Create a service writing through `runs`.
    pub fn new(runs: RunManager, config: HeartbeatConfig) -> Self {
        let owner_id = config.owner_id.unwrap_or_else(generate_owner_id);
        Self {
            inner: Arc::new(Inner {
                owner_id,
                interval: config.interval,
                runs,
                tracked: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                root: CancellationToken::new(),
            }),
        }
    }

    /// This instance's identity.
    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Start heartbeating `run_id`.
    ///
    /// Writes one heartbeat immediately, then every interval. Starting an
    /// already-tracked run is a no-op. Fails with `LeaseNotHeld` if the first
    /// write is refused, and with `HeartbeatShutdown` after shutdown.
    pub async fn start_heartbeat(&self, tenant_id: &str, run_id: &str) -> Result<()> {
        let inner = &self.inner;
        if self.is_shut_down() {
            return Err(CoreError::HeartbeatShutdown {
                owner_id: inner.owner_id.clone(),
            });
        }

        let mut tracked = inner.tracked.lock().await;
        if tracked.contains_key(run_id) {
            debug!(run_id = %run_id, "Heartbeat already running");
            return Ok(());
        }

        let run = inner.runs.get_run(run_id).await?;
        let lease_epoch = run.lease_epoch;
        let held = inner
            .runs
            .store()
            .record_heartbeat(run_id, &inner.owner_id, lease_epoch, Utc::now())
            .await?;
        if !held {
            return Err(CoreError::LeaseNotHeld {
                run_id: run_id.to_string(),
                owner_id: inner.owner_id.clone(),
            });
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let stop = inner.root.child_token();
        let handle = tokio::spawn(heartbeat_loop(
            Arc::clone(inner),
            run_id.to_string(),
            lease_epoch,
            generation,
            stop.clone(),
        ));

        tracked.insert(
            run_id.to_string(),
            Tracked {
                generation,
                tenant_id: tenant_id.to_string(),
                stop,
                handle,
            },
        );

        info!(
            run_id = %run_id,
            tenant_id = %tenant_id,
            owner_id = %inner.owner_id,
            lease_epoch,
            interval_secs = inner.interval.as_secs(),
            "Heartbeat started"
        );
        Ok(())
    }

    /// Stop heartbeating `run_id`. Returns whether it was tracked.
    pub async fn stop_heartbeat(&self, run_id: &str) -> bool {
        let removed = self.inner.tracked.lock().await.remove(run_id);
        match removed {
            Some(entry) => {
                entry.stop.cancel();
                debug!(run_id = %run_id, tenant_id = %entry.tenant_id, "Heartbeat stopped");
                true
            }
            None => false,
        }
    }

    /// Whether `run_id` is currently tracked.
    pub async fn is_tracking(&self, run_id: &str) -> bool {
        self.inner.tracked.lock().await.contains_key(run_id)
    }

    /// Ids of all tracked runs.
    pub async fn tracked_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.tracked.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Find `running` runs whose last proof of life is older than the threshold.
    ///
    /// With `fail_orphans` each one is moved to `failed` with an "orphaned"
    /// error. Runs that heartbeat or change hands after the scan are skipped,
    /// and per-run failures are logged and skipped.
    pub async fn recover_orphaned_runs(&self, options: &OrphanScanOptions) -> Result<Vec<RunRecord>> {
        let cutoff = stale_cutoff(options.stale_threshold)?;
        let orphans = self.find_orphans(cutoff, options.max_runs).await?;

        if orphans.is_empty() {
            debug!("No orphaned runs found");
            return Ok(orphans);
        }
        warn!(
            count = orphans.len(),
            stale_threshold_secs = options.stale_threshold.as_secs(),
            "Found orphaned runs"
        );

        if !options.fail_orphans {
            return Ok(orphans);
        }

        let mut failed = Vec::with_capacity(orphans.len());
        for orphan in orphans {
            let detail = format!("no heartbeat since {}", orphan.last_seen_at().to_rfc3339());
            match self.fail_orphan(&orphan, cutoff, &detail).await {
                Ok(Some(run)) => failed.push(run),
                Ok(None) => {}
                Err(e) => error!(run_id = %orphan.id, error = %e, "Failed to mark orphaned run as failed"),
            }
        }
        Ok(failed)
    }

    /// `running` runs not seen since `cutoff`, oldest created first.
    pub(crate) async fn find_orphans(
        &self,
        cutoff: DateTime<Utc>,
        max_runs: Option<i64>,
    ) -> Result<Vec<RunRecord>> {
        self.inner
            .runs
            .list_runs(&RunFilter {
                statuses: vec![RunStatus::Running],
                last_seen_before: Some(cutoff),
                limit: max_runs,
                ..Default::default()
            })
            .await
    }

    /// Claim an orphan from a scan snapshot.
    ///
    /// Succeeds only if the run's epoch is unchanged and it has not been seen
    /// since `cutoff`. The claim bumps the epoch, so the previous owner's
    /// heartbeats are refused from here on. Returns `None` when the run came
    /// back to life or another instance got there first.
    pub(crate) async fn claim_orphan(
        &self,
        run: &RunRecord,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<RunRecord>> {
        let claimed = self
            .inner
            .runs
            .store()
            .reassign_owner(&run.id, run.lease_epoch, Some(cutoff), &self.inner.owner_id, Utc::now())
            .await?;
        if claimed.is_none() {
            info!(
                run_id = %run.id,
                lease_epoch = run.lease_epoch,
                "Orphan changed since the scan, leaving it alone"
            );
        }
        Ok(claimed)
    }

    /// Claim an orphan and move it to `failed` with an "orphaned: {detail}" error.
    ///
    /// Returns `None` without writing when the claim is lost.
    pub(crate) async fn fail_orphan(
        &self,
        run: &RunRecord,
        cutoff: DateTime<Utc>,
        detail: &str,
    ) -> Result<Option<RunRecord>> {
        let Some(claimed) = self.claim_orphan(run, cutoff).await? else {
            return Ok(None);
        };

        let message = format!("{ORPHANED_ERROR}: {detail}");
        let context =
            TransitionContext::for_run(&run.id).with_initiator(CancellationInitiator::System);
        let failed = self
            .inner
            .runs
            .transition(
                &run.id,
                RunStatus::Failed,
                &context,
                RunPatch {
                    error: Some(message),
                    ..Default::default()
                },
            )
            .await?;
        warn!(
            run_id = %run.id,
            tenant_id = %run.tenant_id,
            previous_owner = ?run.owner_id,
            lease_epoch = claimed.lease_epoch,
            "Orphaned run failed"
        );
        Ok(Some(failed))
    }

    /// Non-terminal runs owned by this instance.
    pub async fn recover_owned_runs(&self) -> Result<Vec<RunRecord>> {
        self.inner
            .runs
            .list_runs(&RunFilter {
                statuses: RunStatus::IN_FLIGHT.to_vec(),
                owner_id: Some(self.inner.owner_id.clone()),
                ..Default::default()
            })
            .await
    }

    /// Stop every heartbeat and refuse new ones.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.root.cancel();

        let drained: Vec<(String, Tracked)> = self.inner.tracked.lock().await.drain().collect();
        let count = drained.len();
        for (run_id, entry) in drained {
            if let Err(e) = entry.handle.await {
                warn!(run_id = %run_id, error = %e, "Heartbeat task ended abnormally");
            }
        }

        info!(owner_id = %self.inner.owner_id, stopped = count, "Heartbeat service shut down");
    }
}

async fn heartbeat_loop(
    inner: Arc<Inner>,
    run_id: String,
    lease_epoch: i64,
    generation: u64,
    stop: CancellationToken,
) {
    let start = tokio::time::Instant::now() + inner.interval;
    let mut ticker = tokio::time::interval_at(start, inner.interval);

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                debug!(run_id = %run_id, "Heartbeat loop cancelled");
                break;
            }

            _ = ticker.tick() => {
                let result = inner
                    .runs
                    .store()
                    .record_heartbeat(&run_id, &inner.owner_id, lease_epoch, Utc::now())
                    .await;
                match result {
                    Ok(true) => debug!(run_id = %run_id, "Heartbeat written"),
                    Ok(false) => {
                        warn!(
                            run_id = %run_id,
                            owner_id = %inner.owner_id,
                            lease_epoch,
                            "Lease lost, stopping heartbeat"
                        );
                        let mut tracked = inner.tracked.lock().await;
                        if tracked.get(&run_id).is_some_and(|t| t.generation == generation) {
                            tracked.remove(&run_id);
                        }
                        break;
                    }
                    Err(e) => warn!(run_id = %run_id, error = %e, "Failed to write heartbeat"),
                }
            }
        }
    }
}
