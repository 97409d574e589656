// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup recovery of runs abandoned by dead instances.
//!
//! Recovery works by:
//!
//! 1. Scanning for `running` runs whose heartbeat has gone stale
//! 2. Checking each run's checkpoint log for a resume point
//! 3. Taking ownership of each orphan through a lease epoch compare-and-set
//!    that also requires the run to still be stale
//! 4. Moving resumable runs back to `running` and restarting their heartbeat
//! 5. Failing the rest with an "orphaned" error
//!
//! A run that heartbeats or changes hands between the scan and the claim is
//! skipped untouched. Per-run problems are recorded in the [`RecoveryReport`], never returned as
//! errors. With `execute_resume` off the scan is a dry run and nothing is
//! written.
//!
//! ```ignore
//! let report = orchestrator.recover_orphaned_runs(&RecoveryOptions::default()).await?;
//! info!(resumed = report.resumed_count, failed = report.failed_count, "Recovery done");
//! ```

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cancellation::CancellationInitiator;
use crate::checkpoint::{NO_RESUMABLE_CHECKPOINT, ResumeContext, ResumeMode, ResumeOptions, ResumeService};
use crate::error::Result;
use crate::heartbeat::{HeartbeatService, stale_cutoff};
use crate::persistence::{RunPatch, RunRecord};
use crate::run_manager::RunManager;
use crate::state_machine::{RunStatus, TransitionContext};

/// Prefix of the outcome reason for runs claimed but not restarted.
pub const CLAIMED_NOT_STARTED: &str = "claimed but not started";

/// Options for a recovery pass.
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Runs not seen for longer than this are orphans.
    pub stale_threshold: Duration,
    /// Maximum orphans handled per pass.
    pub max_runs: i64,
    /// Apply decisions; when false only report them.
    pub execute_resume: bool,
    /// Queue failed steps after the resume point for retry.
    pub retry_failed_steps: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(5 * 60),
            max_runs: 100,
            execute_resume: true,
            retry_failed_steps: false,
        }
    }
}

/// What recovery decided for one orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDecision {
    /// Take the run over and continue it.
    Resume,
    /// Mark the run failed.
    Fail,
    /// Leave the run alone; it came back to life or another instance claimed it.
    Skip,
}

/// Outcome for one orphaned run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecoveryOutcome {
    /// The run.
    pub run_id: String,
    /// Its tenant.
    pub tenant_id: String,
    /// The decision taken.
    pub decision: RecoveryDecision,
    /// Why the run was failed, or why acting on the decision went wrong.
    pub reason: Option<String>,
    /// Whether the decision was applied (always true on a dry run).
    pub success: bool,
    /// Whether this instance took the lease. A claimed run that failed to
    /// start stays `running` under this owner without a heartbeat until a
    /// later pass picks it up again.
    #[serde(default)]
    pub lease_claimed: bool,
    /// Resume plan handed to the executor.
    pub resume_context: Option<ResumeContext>,
}

/// Summary of a recovery pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Orphans found.
    pub orphaned_count: usize,
    /// Runs successfully resumed (or that would be, on a dry run).
    pub resumed_count: usize,
    /// Runs successfully failed (or that would be, on a dry run).
    pub failed_count: usize,
    /// Runs left alone because they changed after the scan.
    #[serde(default)]
    pub skipped_count: usize,
    /// Per-run outcomes.
    pub runs: Vec<RunRecoveryOutcome>,
    /// Wall time of the pass.
    pub duration_ms: u64,
    /// Instance that ran the pass.
    pub owner_id: String,
    /// Whether decisions were only computed.
    pub dry_run: bool,
}

/// Runs the startup recovery pass for one engine instance.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    runs: RunManager,
    resume: ResumeService,
    heartbeat: HeartbeatService,
}

impl RecoveryOrchestrator {
    /// Compose an orchestrator from its collaborators.
    pub fn new(runs: RunManager, resume: ResumeService, heartbeat: HeartbeatService) -> Self {
        Self {
            runs,
            resume,
            heartbeat,
        }
    }

    /// The heartbeat service resumed runs are attached to.
    pub fn heartbeat(&self) -> &HeartbeatService {
        &self.heartbeat
    }

    /// Find orphaned runs and resume or fail each one.
    pub async fn recover_orphaned_runs(&self, options: &RecoveryOptions) -> Result<RecoveryReport> {
        let started = Instant::now();
        let owner_id = self.heartbeat.owner_id().to_string();

        let cutoff = stale_cutoff(options.stale_threshold)?;
        let orphans = self.heartbeat.find_orphans(cutoff, Some(options.max_runs)).await?;

        info!(
            owner_id = %owner_id,
            orphaned = orphans.len(),
            execute = options.execute_resume,
            "Recovery pass started"
        );

        let mut outcomes = Vec::with_capacity(orphans.len());
        for run in &orphans {
            outcomes.push(self.recover_one(run, cutoff, options).await);
        }

        let succeeded = |decision| {
            outcomes
                .iter()
                .filter(|o| o.decision == decision && o.success)
                .count()
        };
        let report = RecoveryReport {
            orphaned_count: orphans.len(),
            resumed_count: succeeded(RecoveryDecision::Resume),
            failed_count: succeeded(RecoveryDecision::Fail),
            skipped_count: succeeded(RecoveryDecision::Skip),
            duration_ms: started.elapsed().as_millis() as u64,
            owner_id,
            dry_run: !options.execute_resume,
            runs: outcomes,
        };

        info!(
            orphaned = report.orphaned_count,
            resumed = report.resumed_count,
            failed = report.failed_count,
            skipped = report.skipped_count,
            duration_ms = report.duration_ms,
            dry_run = report.dry_run,
            "Recovery pass finished"
        );
        Ok(report)
    }

    async fn recover_one(
        &self,
        run: &RunRecord,
        cutoff: DateTime<Utc>,
        options: &RecoveryOptions,
    ) -> RunRecoveryOutcome {
        let mut outcome = RunRecoveryOutcome {
            run_id: run.id.clone(),
            tenant_id: run.tenant_id.clone(),
            decision: RecoveryDecision::Fail,
            reason: None,
            success: false,
            lease_claimed: false,
            resume_context: None,
        };

        let decision = match self.resume.can_resume(Some(run)).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Resume check failed");
                outcome.reason = Some(e.to_string());
                return outcome;
            }
        };

        if decision.can_resume {
            outcome.decision = RecoveryDecision::Resume;
        } else {
            outcome.reason = Some(
                decision
                    .reason
                    .unwrap_or_else(|| NO_RESUMABLE_CHECKPOINT.to_string()),
            );
        }

        if !options.execute_resume {
            outcome.success = true;
            return outcome;
        }

        match outcome.decision {
            RecoveryDecision::Fail => {
                let detail = outcome.reason.as_deref().unwrap_or(NO_RESUMABLE_CHECKPOINT);
                match self.heartbeat.fail_orphan(run, cutoff, detail).await {
                    Ok(Some(_)) => {
                        outcome.lease_claimed = true;
                        outcome.success = true;
                    }
                    Ok(None) => skip(&mut outcome),
                    Err(e) => {
                        warn!(run_id = %run.id, error = %e, "Could not fail orphaned run");
                        outcome.reason = Some(e.to_string());
                    }
                }
            }
            RecoveryDecision::Resume => {
                let taken = match self.heartbeat.claim_orphan(run, cutoff).await {
                    Ok(Some(taken)) => taken,
                    Ok(None) => {
                        skip(&mut outcome);
                        return outcome;
                    }
                    Err(e) => {
                        warn!(run_id = %run.id, error = %e, "Could not claim orphaned run");
                        outcome.reason = Some(e.to_string());
                        return outcome;
                    }
                };
                outcome.lease_claimed = true;

                match self.resume_claimed(run, &taken, options).await {
                    Ok(context) => {
                        outcome.success = true;
                        outcome.resume_context = Some(context);
                    }
                    Err(e) => {
                        self.heartbeat.stop_heartbeat(&run.id).await;
                        error!(
                            run_id = %run.id,
                            tenant_id = %run.tenant_id,
                            lease_epoch = taken.lease_epoch,
                            error = %e,
                            "Claimed orphaned run but could not start it"
                        );
                        outcome.reason = Some(format!("{CLAIMED_NOT_STARTED}: {e}"));
                    }
                }
            }
            RecoveryDecision::Skip => {}
        }
        outcome
    }

    async fn resume_claimed(
        &self,
        run: &RunRecord,
        taken: &RunRecord,
        options: &RecoveryOptions,
    ) -> Result<ResumeContext> {
        let context = self
            .resume
            .resume_run(
                taken,
                ResumeOptions {
                    mode: ResumeMode::FromCheckpoint,
                    replay_step_id: None,
                    retry_failed_steps: options.retry_failed_steps,
                },
            )
            .await?;

        let transition =
            TransitionContext::for_run(&run.id).with_initiator(CancellationInitiator::System);
        self.runs
            .transition(
                &run.id,
                RunStatus::Running,
                &transition,
                RunPatch {
                    resume_count: Some(context.resume_count),
                    ..Default::default()
                },
            )
            .await?;

        self.heartbeat.start_heartbeat(&run.tenant_id, &run.id).await?;

        info!(
            run_id = %run.id,
            tenant_id = %run.tenant_id,
            previous_owner = ?run.owner_id,
            owner_id = %self.heartbeat.owner_id(),
            lease_epoch = taken.lease_epoch,
            resume_count = context.resume_count,
            "Orphaned run resumed"
        );
        Ok(context)
    }

    /// Restart heartbeats for leased runs this identity already owns.
    ///
    /// Used after a restart under a stable identity. Returns the reattached
    /// run ids; runs whose lease was lost meanwhile are skipped.
    pub async fn reattach_owned_runs(&self) -> Result<Vec<String>> {
        let owned = self.heartbeat.recover_owned_runs().await?;
        let mut reattached = Vec::new();

        for run in owned.into_iter().filter(|r| r.status != RunStatus::Pending) {
            match self.heartbeat.start_heartbeat(&run.tenant_id, &run.id).await {
                Ok(()) => reattached.push(run.id),
                Err(e) => warn!(run_id = %run.id, error = %e, "Could not reattach owned run"),
            }
        }

        if !reattached.is_empty() {
            info!(count = reattached.len(), "Reattached owned runs");
        }
        Ok(reattached)
    }

    /// Stop all heartbeats.
    pub async fn shutdown(&self) {
        self.heartbeat.shutdown().await;
    }
}

fn skip(outcome: &mut RunRecoveryOutcome) {
    outcome.decision = RecoveryDecision::Skip;
    outcome.reason = Some("changed since the scan".to_string());
    outcome.success = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{HeartbeatConfig, ORPHANED_ERROR};
    use crate::persistence::{
        InMemoryPersistence, NewRun, RunFilter, RunPatch, RunStore, StepCheckpoint,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// Store whose scan result goes stale immediately: every run it lists is
    /// heartbeated by its current owner right after the listing.
    struct OwnerWakesAfterScan {
        inner: Arc<InMemoryPersistence>,
    }

    #[async_trait]
    impl RunStore for OwnerWakesAfterScan {
        async fn create_run(&self, run: &RunRecord) -> Result<()> {
            self.inner.create_run(run).await
        }

        async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
            self.inner.get_run(run_id).await
        }

        async fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<RunRecord> {
            self.inner.update_run(run_id, patch).await
        }

        async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
            let listed = self.inner.list_runs(filter).await?;
            for run in &listed {
                if let Some(owner) = &run.owner_id {
                    self.inner
                        .record_heartbeat(&run.id, owner, run.lease_epoch, Utc::now())
                        .await?;
                }
            }
            Ok(listed)
        }

        async fn count_in_flight_runs(&self, tenant_id: Option<&str>) -> Result<i64> {
            self.inner.count_in_flight_runs(tenant_id).await
        }

        async fn record_heartbeat(
            &self,
            run_id: &str,
            owner_id: &str,
            lease_epoch: i64,
            at: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.record_heartbeat(run_id, owner_id, lease_epoch, at).await
        }

        async fn reassign_owner(
            &self,
            run_id: &str,
            expected_epoch: i64,
            stale_before: Option<DateTime<Utc>>,
            new_owner: &str,
            at: DateTime<Utc>,
        ) -> Result<Option<RunRecord>> {
            self.inner
                .reassign_owner(run_id, expected_epoch, stale_before, new_owner, at)
                .await
        }
    }

    struct Fixture {
        store: Arc<InMemoryPersistence>,
        orchestrator: RecoveryOrchestrator,
        resume: ResumeService,
    }

    fn fixture(owner: &str) -> Fixture {
        let store = Arc::new(InMemoryPersistence::new());
        fixture_over(store.clone(), store, owner)
    }

    fn fixture_over(
        store: Arc<InMemoryPersistence>,
        run_store: Arc<dyn RunStore>,
        owner: &str,
    ) -> Fixture {
        let runs = RunManager::new(run_store);
        let resume = ResumeService::new(store.clone());
        let heartbeat = HeartbeatService::new(
            runs.clone(),
            HeartbeatConfig {
                owner_id: Some(owner.to_string()),
                interval: Duration::from_secs(30),
            },
        );
        Fixture {
            orchestrator: RecoveryOrchestrator::new(runs, resume.clone(), heartbeat),
            resume,
            store,
        }
    }

    async fn orphan(fx: &Fixture, id: &str) -> RunRecord {
        let now = Utc::now();
        let mut run = RunRecord::new(
            NewRun {
                id: Some(id.to_string()),
                tenant_id: "tenant-1".to_string(),
                run_type: "issue_fix".to_string(),
                owner_id: Some("instance-dead".to_string()),
                ..Default::default()
            },
            now - chrono::Duration::minutes(20),
        );
        run.status = RunStatus::Running;
        run.last_heartbeat_at = Some(now - chrono::Duration::minutes(10));
        fx.store.create_run(&run).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_resumes_or_fails_each_orphan() {
        let fx = fixture("instance-new");
        orphan(&fx, "with-checkpoint").await;
        orphan(&fx, "without-checkpoint").await;
        fx.resume
            .save_checkpoint(
                "with-checkpoint",
                &StepCheckpoint::completed("triage", "triager", json!({"label": "bug"})),
            )
            .await
            .unwrap();

        let report = fx
            .orchestrator
            .recover_orphaned_runs(&RecoveryOptions::default())
            .await
            .unwrap();

        assert_eq!(report.orphaned_count, 2);
        assert_eq!(report.resumed_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.owner_id, "instance-new");
        assert!(report.runs.iter().all(|o| o.success && o.lease_claimed));

        let resumed = fx.store.get_run("with-checkpoint").await.unwrap().unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        assert_eq!(resumed.owner_id.as_deref(), Some("instance-new"));
        assert_eq!(resumed.resume_count, 1);
        assert_eq!(resumed.lease_epoch, 1);
        assert!(fx.orchestrator.heartbeat().is_tracking("with-checkpoint").await);

        let failed = fx.store.get_run("without-checkpoint").await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error.as_deref().unwrap().starts_with(ORPHANED_ERROR));

        fx.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_owner_heartbeat_after_scan_wins() {
        let store = Arc::new(InMemoryPersistence::new());
        let wrapped = Arc::new(OwnerWakesAfterScan {
            inner: store.clone(),
        });
        let fx = fixture_over(store, wrapped, "instance-new");
        orphan(&fx, "with-checkpoint").await;
        orphan(&fx, "without-checkpoint").await;
        fx.resume
            .save_checkpoint(
                "with-checkpoint",
                &StepCheckpoint::completed("triage", "triager", json!({})),
            )
            .await
            .unwrap();

        let report = fx
            .orchestrator
            .recover_orphaned_runs(&RecoveryOptions::default())
            .await
            .unwrap();

        assert_eq!(report.orphaned_count, 2);
        assert_eq!(report.skipped_count, 2);
        assert_eq!(report.resumed_count, 0);
        assert_eq!(report.failed_count, 0);
        for outcome in &report.runs {
            assert_eq!(outcome.decision, RecoveryDecision::Skip);
            assert!(!outcome.lease_claimed);
        }

        for id in ["with-checkpoint", "without-checkpoint"] {
            let run = fx.store.get_run(id).await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Running);
            assert_eq!(run.owner_id.as_deref(), Some("instance-dead"));
            assert_eq!(run.lease_epoch, 0);
            assert!(run.error.is_none());
        }
        assert!(fx.orchestrator.heartbeat().tracked_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_run_that_cannot_start_is_reported() {
        let fx = fixture("instance-new");
        orphan(&fx, "r1").await;
        fx.resume
            .save_checkpoint("r1", &StepCheckpoint::completed("triage", "triager", json!({})))
            .await
            .unwrap();
        // A shut down heartbeat service refuses new runs after the claim.
        fx.orchestrator.shutdown().await;

        let report = fx
            .orchestrator
            .recover_orphaned_runs(&RecoveryOptions::default())
            .await
            .unwrap();

        assert_eq!(report.resumed_count, 0);
        let outcome = &report.runs[0];
        assert_eq!(outcome.decision, RecoveryDecision::Resume);
        assert!(outcome.lease_claimed);
        assert!(!outcome.success);
        assert!(outcome.resume_context.is_none());
        assert!(
            outcome
                .reason
                .as_deref()
                .unwrap()
                .starts_with(CLAIMED_NOT_STARTED)
        );

        let run = fx.store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.owner_id.as_deref(), Some("instance-new"));
        assert_eq!(run.lease_epoch, 1);
        assert!(!fx.orchestrator.heartbeat().is_tracking("r1").await);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_mutate() {
        let fx = fixture("instance-new");
        let before = orphan(&fx, "r1").await;

        let report = fx
            .orchestrator
            .recover_orphaned_runs(&RecoveryOptions {
                execute_resume: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.runs[0].decision, RecoveryDecision::Fail);
        assert_eq!(report.runs[0].reason.as_deref(), Some("no checkpoints"));
        let after = fx.store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_max_runs_caps_the_pass() {
        let fx = fixture("instance-new");
        for i in 0..3 {
            orphan(&fx, &format!("r{i}")).await;
        }
        let report = fx
            .orchestrator
            .recover_orphaned_runs(&RecoveryOptions {
                max_runs: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.orphaned_count, 2);
    }

    #[tokio::test]
    async fn test_reattach_owned_runs() {
        let fx = fixture("instance-stable");
        let mut run = orphan(&fx, "mine").await;
        run.id = "pending-mine".to_string();
        run.status = RunStatus::Pending;
        run.owner_id = Some("instance-stable".to_string());
        fx.store.create_run(&run).await.unwrap();
        fx.store
            .reassign_owner("mine", 0, None, "instance-stable", Utc::now())
            .await
            .unwrap();

        let reattached = fx.orchestrator.reattach_owned_runs().await.unwrap();
        assert_eq!(reattached, vec!["mine".to_string()]);
        fx.orchestrator.shutdown().await;
    }
}
