// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run status state machine.
//!
//! Every status mutation in the engine goes through [`validate_transition`].
//!
//! ```text
//! pending ──► running ◄──► awaiting_approval
//!    │          │   ◄──► waiting_external
//!    │          │              │
//!    ▼          ▼              ▼
//!  completed | failed | cancelled     (terminal, no exits)
//! ```
//!
//! `pending` may only go to `running`, `failed` or `cancelled`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationInitiator;
use crate::error::CoreError;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started.
    Pending,
    /// Actively executing steps.
    Running,
    /// Paused until a human approves.
    AwaitingApproval,
    /// Paused until an external system calls back.
    WaitingExternal,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by a user, the system, a timeout, or a policy.
    Cancelled,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::AwaitingApproval,
        RunStatus::WaitingExternal,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    /// Statuses that still count as "in flight".
    pub const IN_FLIGHT: [RunStatus; 4] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::AwaitingApproval,
        RunStatus::WaitingExternal,
    ];

    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::WaitingExternal => "waiting_external",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::validation("status", format!("unknown run status '{s}'")))
    }
}

/// Legal outbound transitions for each status. Terminal statuses have none.
pub fn get_next_valid_states(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match from {
        Pending => &[Running, Cancelled, Failed],
        Running => &[
            Completed,
            Failed,
            Cancelled,
            AwaitingApproval,
            WaitingExternal,
        ],
        AwaitingApproval => &[Running, Completed, Failed, Cancelled],
        WaitingExternal => &[Running, Completed, Failed, Cancelled],
        Completed | Failed | Cancelled => &[],
    }
}

/// Whether `status` is terminal.
pub fn is_terminal_state(status: RunStatus) -> bool {
    status.is_terminal()
}

/// Whether `from -> to` is legal. Self-transitions are always legal.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    from == to || get_next_valid_states(from).contains(&to)
}

/// Caller context attached to transition errors for auditing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// Run being transitioned.
    pub run_id: Option<String>,
    /// User who asked for the change, if any.
    pub user_id: Option<String>,
    /// Who initiated the change.
    pub initiator: Option<CancellationInitiator>,
}

impl TransitionContext {
    /// Context for a run, with no user attached.
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Default::default()
        }
    }

    /// Attach the initiating user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the initiator kind.
    pub fn with_initiator(mut self, initiator: CancellationInitiator) -> Self {
        self.initiator = Some(initiator);
        self
    }
}

/// An illegal status change was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransitionError {
    /// Status the run was in.
    pub from: RunStatus,
    /// Status that was requested.
    pub to: RunStatus,
    /// Run the change was requested for.
    pub run_id: Option<String>,
    /// User who requested it.
    pub user_id: Option<String>,
    /// Initiator kind.
    pub initiator: Option<CancellationInitiator>,
    /// Statuses that would have been accepted.
    pub valid_next_states: Vec<RunStatus>,
    /// Whether `from` was terminal.
    pub from_terminal: bool,
}

impl fmt::Display for InvalidTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = match &self.run_id {
            Some(id) => format!("run '{id}'"),
            None => "run".to_string(),
        };
        if self.from_terminal {
            return write!(
                f,
                "Invalid transition for {subject}: '{}' is terminal and cannot move to '{}'",
                self.from, self.to
            );
        }
        let allowed: Vec<&str> = self.valid_next_states.iter().map(RunStatus::as_str).collect();
        write!(
            f,
            "Invalid transition for {subject}: '{}' -> '{}' (allowed: {})",
            self.from,
            self.to,
            allowed.join(", ")
        )
    }
}

impl std::error::Error for InvalidTransitionError {}

/// Check a transition, returning a structured error when it is illegal.
pub fn validate_transition(
    from: RunStatus,
    to: RunStatus,
    context: &TransitionContext,
) -> Result<(), InvalidTransitionError> {
    if is_valid_transition(from, to) {
        return Ok(());
    }

    Err(InvalidTransitionError {
        from,
        to,
        run_id: context.run_id.clone(),
        user_id: context.user_id.clone(),
        initiator: context.initiator,
        valid_next_states: get_next_valid_states(from).to_vec(),
        from_terminal: from.is_terminal(),
    })
}

/// Human-readable label for a transition, used in logs and audit entries.
pub fn describe_transition(from: RunStatus, to: RunStatus) -> &'static str {
    use RunStatus::*;
    match (from, to) {
        (a, b) if a == b => "no-op",
        (Pending, Running) => "started",
        (AwaitingApproval, Running) => "approved",
        (WaitingExternal, Running) => "external event received",
        (_, AwaitingApproval) => "waiting for approval",
        (_, WaitingExternal) => "waiting for external event",
        (_, Completed) => "completed",
        (_, Failed) => "failed",
        (_, Cancelled) => "cancelled",
        _ => "transition",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[(RunStatus, &[RunStatus])] = &[
        (
            RunStatus::Pending,
            &[RunStatus::Running, RunStatus::Cancelled, RunStatus::Failed],
        ),
        (
            RunStatus::Running,
            &[
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
                RunStatus::AwaitingApproval,
                RunStatus::WaitingExternal,
            ],
        ),
        (
            RunStatus::AwaitingApproval,
            &[
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ],
        ),
        (
            RunStatus::WaitingExternal,
            &[
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ],
        ),
    ];

    fn in_table(from: RunStatus, to: RunStatus) -> bool {
        TABLE
            .iter()
            .any(|(f, allowed)| *f == from && allowed.contains(&to))
    }

    #[test]
    fn test_every_pair_matches_table() {
        let ctx = TransitionContext::for_run("run-1");
        for from in RunStatus::ALL {
            for to in RunStatus::ALL {
                let result = validate_transition(from, to, &ctx);
                if from == to || in_table(from, to) {
                    assert!(result.is_ok(), "{from} -> {to} should be legal");
                } else {
                    assert!(result.is_err(), "{from} -> {to} should be rejected");
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(is_terminal_state(status));
            assert!(get_next_valid_states(status).is_empty());
        }
        for status in RunStatus::IN_FLIGHT {
            assert!(!is_terminal_state(status));
            assert!(!get_next_valid_states(status).is_empty());
        }
    }

    #[test]
    fn test_error_carries_context() {
        let ctx = TransitionContext::for_run("run-42")
            .with_user("user-7")
            .with_initiator(CancellationInitiator::User);

        let err = validate_transition(RunStatus::Pending, RunStatus::Completed, &ctx).unwrap_err();
        assert_eq!(err.from, RunStatus::Pending);
        assert_eq!(err.to, RunStatus::Completed);
        assert_eq!(err.run_id.as_deref(), Some("run-42"));
        assert_eq!(err.user_id.as_deref(), Some("user-7"));
        assert_eq!(err.initiator, Some(CancellationInitiator::User));
        assert_eq!(
            err.valid_next_states,
            vec![RunStatus::Running, RunStatus::Cancelled, RunStatus::Failed]
        );
        assert!(!err.from_terminal);
        assert!(err.to_string().contains("allowed: running, cancelled, failed"));
    }

    #[test]
    fn test_error_from_terminal() {
        let err = validate_transition(
            RunStatus::Cancelled,
            RunStatus::Running,
            &TransitionContext::default(),
        )
        .unwrap_err();
        assert!(err.from_terminal);
        assert!(err.valid_next_states.is_empty());
        assert!(err.to_string().contains("is terminal"));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_describe_transition() {
        assert_eq!(
            describe_transition(RunStatus::Pending, RunStatus::Running),
            "started"
        );
        assert_eq!(
            describe_transition(RunStatus::Running, RunStatus::Running),
            "no-op"
        );
        assert_eq!(
            describe_transition(RunStatus::Running, RunStatus::Cancelled),
            "cancelled"
        );
    }
}
