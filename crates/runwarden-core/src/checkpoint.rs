// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint log and resume planning.
//!
//! Each step attempt appends a [`StepCheckpoint`] to the run's log. The newest
//! checkpoint that is both `completed` and `resumable` is the resume point;
//! [`ResumeService::resume_run`] turns it into a [`ResumeContext`] the executor
//! uses to skip finished steps and pick up carried state.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::persistence::{CheckpointStatus, CheckpointStore, RunRecord, StepCheckpoint};
use crate::state_machine::RunStatus;

/// Reason given when a run has checkpoints but none qualifies.
pub const NO_RESUMABLE_CHECKPOINT: &str = "no resumable checkpoint";

/// How a resumed run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Start over, ignoring every checkpoint.
    FromStart,
    /// Continue after the newest resumable checkpoint.
    #[default]
    FromCheckpoint,
    /// Re-execute one idempotent step in place.
    ReplayStep,
}

/// How carried state is reconstructed from a resume context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Use the resume checkpoint's output as is.
    CarryForward,
    /// Merge outputs of every completed step. Not implemented.
    Merge,
    /// Rebuild state by replaying steps. Not implemented.
    Replay,
}

impl RecoveryStrategy {
    /// Returns the string representation of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CarryForward => "carry_forward",
            Self::Merge => "merge",
            Self::Replay => "replay",
        }
    }
}

/// A qualifying checkpoint and its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// The checkpoint.
    pub checkpoint: StepCheckpoint,
    /// Index in the timestamp-ordered log.
    pub index: usize,
}

/// Whether a run can be resumed, and from where.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeDecision {
    /// Resume is possible.
    pub can_resume: bool,
    /// Why not, when `can_resume` is false.
    pub reason: Option<String>,
    /// Where to resume from.
    pub resume_point: Option<ResumePoint>,
}

impl ResumeDecision {
    fn refuse(reason: impl Into<String>) -> Self {
        Self {
            can_resume: false,
            reason: Some(reason.into()),
            resume_point: None,
        }
    }
}

/// Options for [`ResumeService::resume_run`].
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Resume mode.
    pub mode: ResumeMode,
    /// Step to replay; required for [`ResumeMode::ReplayStep`].
    pub replay_step_id: Option<String>,
    /// Queue failed steps after the resume point for retry.
    pub retry_failed_steps: bool,
}

/// Everything an executor needs to continue a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeContext {
    /// Run being resumed.
    pub run_id: String,
    /// Chosen mode.
    pub mode: ResumeMode,
    /// Checkpoint resumed from (or the step being replayed).
    pub checkpoint: Option<StepCheckpoint>,
    /// Steps proven complete that must not run again.
    pub skip_step_ids: Vec<String>,
    /// State handed to the next step.
    pub carried_state: Option<serde_json::Value>,
    /// The run's resume count after this resume.
    pub resume_count: i32,
    /// Failed steps after the resume point to run again.
    pub retry_step_ids: Vec<String>,
}

/// Checkpoint log access and resume planning.
#[derive(Clone)]
pub struct ResumeService {
    checkpoints: Arc<dyn CheckpointStore>,
}

impl ResumeService {
    /// Create a service over a checkpoint store.
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { checkpoints }
    }

    /// Append a checkpoint to a run's log.
    pub async fn save_checkpoint(&self, run_id: &str, checkpoint: &StepCheckpoint) -> Result<()> {
        if checkpoint.step_id.is_empty() {
            return Err(CoreError::validation("step_id", "must not be empty"));
        }
        self.checkpoints.save_checkpoint(run_id, checkpoint).await?;
        debug!(
            run_id = %run_id,
            step_id = %checkpoint.step_id,
            status = checkpoint.status.as_str(),
            resumable = checkpoint.resumable,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// The run's checkpoint log, oldest first.
    pub async fn get_checkpoints(&self, run_id: &str) -> Result<Vec<StepCheckpoint>> {
        self.checkpoints.get_checkpoints(run_id).await
    }

    /// Newest checkpoint that is completed and resumable.
    pub async fn find_resume_point(&self, run_id: &str) -> Result<Option<ResumePoint>> {
        let log = self.checkpoints.get_checkpoints(run_id).await?;
        Ok(resume_point_in(&log))
    }

    /// Decide whether `run` can be resumed.
    ///
    /// Absent, completed and cancelled runs are refused, as are runs without a
    /// qualifying checkpoint. Failed runs are eligible.
    pub async fn can_resume(&self, run: Option<&RunRecord>) -> Result<ResumeDecision> {
        let Some(run) = run else {
            return Ok(ResumeDecision::refuse("run not found"));
        };
        match run.status {
            RunStatus::Completed => return Ok(ResumeDecision::refuse("run is already completed")),
            RunStatus::Cancelled => return Ok(ResumeDecision::refuse("run was cancelled")),
            _ => {}
        }

        let log = self.checkpoints.get_checkpoints(&run.id).await?;
        if log.is_empty() {
            return Ok(ResumeDecision::refuse("no checkpoints"));
        }

        Ok(match resume_point_in(&log) {
            Some(point) => ResumeDecision {
                can_resume: true,
                reason: None,
                resume_point: Some(point),
            },
            None => ResumeDecision::refuse(NO_RESUMABLE_CHECKPOINT),
        })
    }

    /// Build the resume context for `run`.
    ///
    /// Fails with `NotResumable` when the requested mode is not possible.
    pub async fn resume_run(&self, run: &RunRecord, options: ResumeOptions) -> Result<ResumeContext> {
        let not_resumable = |reason: String| CoreError::NotResumable {
            run_id: run.id.clone(),
            reason,
        };

        let context = match options.mode {
            ResumeMode::FromStart => {
                if matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
                    return Err(not_resumable(format!("run is {}", run.status)));
                }
                ResumeContext {
                    run_id: run.id.clone(),
                    mode: ResumeMode::FromStart,
                    checkpoint: None,
                    skip_step_ids: Vec::new(),
                    carried_state: None,
                    resume_count: run.resume_count + 1,
                    retry_step_ids: Vec::new(),
                }
            }
            ResumeMode::FromCheckpoint => {
                let decision = self.can_resume(Some(run)).await?;
                let Some(point) = decision.resume_point else {
                    return Err(not_resumable(
                        decision.reason.unwrap_or_else(|| NO_RESUMABLE_CHECKPOINT.to_string()),
                    ));
                };
                let log = self.checkpoints.get_checkpoints(&run.id).await?;
                let retry_step_ids = if options.retry_failed_steps {
                    failed_after(&log, point.index)
                } else {
                    Vec::new()
                };
                ResumeContext {
                    run_id: run.id.clone(),
                    mode: ResumeMode::FromCheckpoint,
                    skip_step_ids: completed_through(&log, point.index, None),
                    carried_state: point.checkpoint.output.clone(),
                    checkpoint: Some(point.checkpoint),
                    resume_count: run.resume_count + 1,
                    retry_step_ids,
                }
            }
            ResumeMode::ReplayStep => {
                let Some(step_id) = options.replay_step_id.as_deref() else {
                    return Err(CoreError::validation(
                        "replay_step_id",
                        "required for replay_step mode",
                    ));
                };
                if matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
                    return Err(not_resumable(format!("run is {}", run.status)));
                }
                let log = self.checkpoints.get_checkpoints(&run.id).await?;
                let Some((_, last)) = last_for_step(&log, step_id) else {
                    return Err(not_resumable(format!("step '{step_id}' has no checkpoint")));
                };
                if !is_replayable(last) {
                    return Err(not_resumable(format!(
                        "step '{step_id}' is not idempotent and completed"
                    )));
                }
                ResumeContext {
                    run_id: run.id.clone(),
                    mode: ResumeMode::ReplayStep,
                    skip_step_ids: completed_through(&log, log.len() - 1, Some(step_id)),
                    carried_state: last.input.clone(),
                    checkpoint: Some(last.clone()),
                    resume_count: run.resume_count + 1,
                    retry_step_ids: Vec::new(),
                }
            }
        };

        info!(
            run_id = %run.id,
            mode = ?context.mode,
            resume_count = context.resume_count,
            skipped = context.skip_step_ids.len(),
            "Resume context built"
        );
        Ok(context)
    }

    /// Whether `step_id` may be blindly re-executed.
    ///
    /// True only if the step's most recent checkpoint is idempotent and completed.
    pub async fn can_replay_step(&self, run_id: &str, step_id: &str) -> Result<bool> {
        let log = self.checkpoints.get_checkpoints(run_id).await?;
        Ok(last_for_step(&log, step_id).is_some_and(|(_, checkpoint)| is_replayable(checkpoint)))
    }

    /// Reconstruct the state to hand to the next step.
    pub fn recover_state(
        &self,
        context: &ResumeContext,
        strategy: RecoveryStrategy,
    ) -> Result<Option<serde_json::Value>> {
        match strategy {
            RecoveryStrategy::CarryForward => Ok(context.carried_state.clone()),
            RecoveryStrategy::Merge | RecoveryStrategy::Replay => {
                Err(CoreError::UnsupportedRecoveryStrategy {
                    strategy: strategy.as_str().to_string(),
                })
            }
        }
    }

    /// Drop a run's checkpoint log.
    pub async fn clear_checkpoints(&self, run_id: &str) -> Result<u64> {
        self.checkpoints.clear_checkpoints(run_id).await
    }
}

fn resume_point_in(log: &[StepCheckpoint]) -> Option<ResumePoint> {
    log.iter()
        .enumerate()
        .rev()
        .find(|(_, c)| c.status == CheckpointStatus::Completed && c.resumable)
        .map(|(index, checkpoint)| ResumePoint {
            checkpoint: checkpoint.clone(),
            index,
        })
}

fn last_for_step<'a>(log: &'a [StepCheckpoint], step_id: &str) -> Option<(usize, &'a StepCheckpoint)> {
    log.iter().enumerate().rev().find(|(_, c)| c.step_id == step_id)
}

fn is_replayable(checkpoint: &StepCheckpoint) -> bool {
    checkpoint.idempotent && checkpoint.status == CheckpointStatus::Completed
}

/// Ids of completed steps up to and including `index`, first-seen order.
fn completed_through(log: &[StepCheckpoint], index: usize, except: Option<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    log.iter()
        .take(index + 1)
        .filter(|c| c.status == CheckpointStatus::Completed)
        .filter(|c| except != Some(c.step_id.as_str()))
        .filter(|c| seen.insert(c.step_id.clone()))
        .map(|c| c.step_id.clone())
        .collect()
}

/// Ids of steps whose latest checkpoint after `index` is a failure.
fn failed_after(log: &[StepCheckpoint], index: usize) -> Vec<String> {
    let tail = &log[index + 1..];
    let mut seen = HashSet::new();
    tail.iter()
        .filter(|c| c.status == CheckpointStatus::Failed)
        .filter(|c| {
            last_for_step(tail, &c.step_id)
                .is_some_and(|(_, last)| last.status == CheckpointStatus::Failed)
        })
        .filter(|c| seen.insert(c.step_id.clone()))
        .map(|c| c.step_id.clone())
        .collect()
}
