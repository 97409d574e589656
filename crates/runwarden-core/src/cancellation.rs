// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cooperative cancellation for run execution.
//!
//! Cancellation is never preemptive. Step executors call
//! [`CancellationPoint::check`] (or [`CancellationToken::throw_if_cancelled`])
//! between work phases; a long synchronous step body runs to completion.
//! Timeouts are expressed as a cancellation with the
//! [`CancellationInitiator::Timeout`] initiator.
//!
//! ```ignore
//! let ctx = create_cancellation_context(&run.id, &run.tenant_id);
//! let before_plan = create_step_checkpoint(&ctx, "plan");
//!
//! ctx.compensations().register(
//!     CompensationAction::new("delete-branch", "Delete working branch", || async {
//!         git.delete_branch("runwarden/fix").await
//!     })
//!     .with_priority(10),
//! )?;
//!
//! before_plan.check().await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compensation::{CompensationRegistry, CompensationSummary};
use crate::error::{CoreError, Result};
use crate::persistence::RunPatch;
use crate::run_manager::RunManager;
use crate::state_machine::{InvalidTransitionError, RunStatus, TransitionContext, validate_transition};

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationInitiator {
    /// An end user.
    User,
    /// The engine itself (shutdown, recovery).
    System,
    /// A deadline expired.
    Timeout,
    /// A policy (quota, budget, governance) tripped.
    Policy,
}

impl CancellationInitiator {
    /// Returns the string representation of the initiator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Timeout => "timeout",
            Self::Policy => "policy",
        }
    }
}

impl fmt::Display for CancellationInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run or operation was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationReason {
    /// Who asked for it.
    pub initiator: CancellationInitiator,
    /// Free-text explanation.
    pub reason: String,
    /// When it was requested.
    pub requested_at: DateTime<Utc>,
    /// Requesting user, when the initiator is a user.
    pub user_id: Option<String>,
}

impl CancellationReason {
    /// Create a reason stamped with the current time.
    pub fn new(initiator: CancellationInitiator, reason: impl Into<String>) -> Self {
        Self {
            initiator,
            reason: reason.into(),
            requested_at: Utc::now(),
            user_id: None,
        }
    }

    /// A user-initiated cancellation.
    pub fn by_user(user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(CancellationInitiator::User, reason).with_user(user_id)
    }

    /// A deadline-initiated cancellation.
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            CancellationInitiator::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    /// Attach the requesting user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Raised at a cancellation point once the token has been cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledError {
    /// The reason captured by the first `cancel` call.
    pub reason: CancellationReason,
    /// Cancellation point that observed it, if known.
    pub step: Option<String>,
}

impl CancelledError {
    /// Wrap a reason.
    pub fn new(reason: CancellationReason) -> Self {
        Self { reason, step: None }
    }

    /// Record which step observed the cancellation.
    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cancelled by {}: {}",
            self.reason.initiator, self.reason.reason
        )?;
        if let Some(step) = &self.step {
            write!(f, " (at step '{step}')")?;
        }
        Ok(())
    }
}

impl std::error::Error for CancelledError {}

type Listener = Box<dyn FnOnce(&CancellationReason) + Send>;

#[derive(Default)]
struct TokenState {
    reason: Option<CancellationReason>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

struct TokenInner {
    state: Mutex<TokenState>,
    // Cancelled only after `state.reason` is set.
    signal: tokio_util::sync::CancellationToken,
}

impl TokenInner {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cancellation flag that remembers why it was tripped.
///
/// Clones share state. The first `cancel` wins; later calls are ignored.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState::default()),
                signal: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().reason.is_some()
    }

    /// The captured reason, if cancelled.
    pub fn reason(&self) -> Option<CancellationReason> {
        self.inner.lock().reason.clone()
    }

    /// Cancel the token. Returns `false` if it was already cancelled.
    pub fn cancel(&self, reason: CancellationReason) -> bool {
        let listeners = {
            let mut state = self.inner.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.listeners)
        };

        self.inner.signal.cancel();
        for (_, listener) in listeners {
            listener(&reason);
        }
        true
    }

    /// Return `Err(CancelledError)` carrying the captured reason once cancelled.
    pub fn throw_if_cancelled(&self) -> std::result::Result<(), CancelledError> {
        match self.reason() {
            Some(reason) => Err(CancelledError::new(reason)),
            None => Ok(()),
        }
    }

    /// Register a callback fired once on cancellation.
    ///
    /// Fires immediately if the token is already cancelled.
    pub fn on_cancelled<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce(&CancellationReason) + Send + 'static,
    {
        let mut state = self.inner.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            callback(&reason);
            return CancellationRegistration {
                token: Weak::new(),
                id: None,
            };
        }

        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push((id, Box::new(callback)));

        CancellationRegistration {
            token: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Wait until the token is cancelled and return the reason.
    pub async fn when_cancelled(&self) -> CancellationReason {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }
            self.inner.signal.cancelled().await;
        }
    }

    /// Derive a token that is cancelled whenever this one is.
    ///
    /// Cancelling the child does not affect the parent.
    pub fn create_child(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let weak_child = Arc::downgrade(&child.inner);
        let _registration = self.on_cancelled(move |reason| {
            if let Some(inner) = weak_child.upgrade() {
                CancellationToken { inner }.cancel(reason.clone());
            }
        });
        child
    }
}

/// Handle returned by [`CancellationToken::on_cancelled`].
///
/// Dropping the handle keeps the listener registered.
#[derive(Debug)]
pub struct CancellationRegistration {
    token: Weak<TokenInner>,
    id: Option<u64>,
}

impl CancellationRegistration {
    /// Remove the listener if it has not fired yet.
    pub fn unsubscribe(self) {
        let (Some(inner), Some(id)) = (self.token.upgrade(), self.id) else {
            return;
        };
        inner.lock().listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

/// Owns a token and controls when it is cancelled.
#[derive(Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
    disposed: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationTokenSource {
    /// Create a source with a fresh token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            disposed: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        }
    }

    /// The token controlled by this source.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the token. Rejected once the source is disposed.
    pub fn cancel(&self, reason: CancellationReason) -> Result<bool> {
        if self.is_disposed() {
            return Err(CoreError::TokenSourceDisposed);
        }
        Ok(self.token.cancel(reason))
    }

    /// Cancel with a timeout reason after `after` elapses.
    ///
    /// Replaces any previously armed timer. Requires a tokio runtime.
    pub fn cancel_after(&self, after: Duration) -> Result<()> {
        if self.is_disposed() {
            return Err(CoreError::TokenSourceDisposed);
        }

        let token = self.token.clone();
        let disposed = self.disposed.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if !disposed.load(Ordering::SeqCst) {
                token.cancel(CancellationReason::timeout(after));
            }
        });

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Dispose the source. Later `cancel` calls are rejected.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Per-run cancellation state: a token source plus its rollback registry.
#[derive(Debug)]
pub struct CancellationContext {
    run_id: String,
    tenant_id: String,
    source: CancellationTokenSource,
    compensations: CompensationRegistry,
}

/// Create a fresh cancellation context for a run.
pub fn create_cancellation_context(
    run_id: impl Into<String>,
    tenant_id: impl Into<String>,
) -> CancellationContext {
    CancellationContext {
        run_id: run_id.into(),
        tenant_id: tenant_id.into(),
        source: CancellationTokenSource::new(),
        compensations: CompensationRegistry::new(),
    }
}

/// Create the cancellation point a step executor calls before `step_name`.
pub fn create_step_checkpoint(
    ctx: &CancellationContext,
    step_name: impl Into<String>,
) -> CancellationPoint {
    CancellationPoint {
        run_id: ctx.run_id.clone(),
        step: step_name.into(),
        token: ctx.token().clone(),
    }
}

impl CancellationContext {
    /// Run this context belongs to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Tenant of the run.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The run's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        self.source.token()
    }

    /// The token source, for arming timeouts or disposing.
    pub fn source(&self) -> &CancellationTokenSource {
        &self.source
    }

    /// Rollback actions registered during forward execution.
    pub fn compensations(&self) -> &CompensationRegistry {
        &self.compensations
    }

    /// Cancel the run's token.
    pub fn cancel(&self, reason: CancellationReason) -> Result<bool> {
        info!(
            run_id = %self.run_id,
            tenant_id = %self.tenant_id,
            initiator = %reason.initiator,
            reason = %reason.reason,
            "Cancellation requested"
        );
        self.source.cancel(reason)
    }

    /// Cancel the run, roll back registered actions, and record the outcome.
    ///
    /// The run moves to `cancelled` through the state machine; the cancellation
    /// record and compensation log are stored on it. A run that is already
    /// terminal is rejected with `InvalidTransition` before the token is
    /// cancelled or any compensation runs.
    pub async fn cancel_run(
        &self,
        runs: &RunManager,
        reason: CancellationReason,
    ) -> Result<CompensationSummary> {
        let mut transition = TransitionContext::for_run(&self.run_id).with_initiator(reason.initiator);
        if let Some(user_id) = &reason.user_id {
            transition = transition.with_user(user_id);
        }

        let run = runs.get_run(&self.run_id).await?;
        if run.status.is_terminal() {
            warn!(run_id = %self.run_id, status = %run.status, "Refusing to cancel a finished run");
            return Err(InvalidTransitionError {
                from: run.status,
                to: RunStatus::Cancelled,
                run_id: transition.run_id.clone(),
                user_id: transition.user_id.clone(),
                initiator: transition.initiator,
                valid_next_states: Vec::new(),
                from_terminal: true,
            }
            .into());
        }
        validate_transition(run.status, RunStatus::Cancelled, &transition)?;

        self.cancel(reason.clone())?;
        // First cancel wins; record whatever reason the token captured.
        let reason = self.token().reason().unwrap_or(reason);

        let summary = self.compensations.execute_compensations().await?;
        if !summary.rollback_complete {
            warn!(
                run_id = %self.run_id,
                critical_failures = summary.critical_failures,
                "Rollback incomplete, operator attention required"
            );
        }

        runs.transition(
            &self.run_id,
            RunStatus::Cancelled,
            &transition,
            RunPatch {
                cancellation: Some(reason),
                compensation_log: Some(summary.results.clone()),
                ..Default::default()
            },
        )
        .await?;

        Ok(summary)
    }
}

/// A cooperative cancellation point between work phases.
#[derive(Debug, Clone)]
pub struct CancellationPoint {
    run_id: String,
    step: String,
    token: CancellationToken,
}

impl CancellationPoint {
    /// Step this point guards.
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Fail with `CancelledError` if the run has been cancelled.
    pub async fn check(&self) -> std::result::Result<(), CancelledError> {
        self.token.throw_if_cancelled().map_err(|err| {
            debug!(run_id = %self.run_id, step = %self.step, "Cancellation point tripped");
            err.at_step(&self.step)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn user_reason(text: &str) -> CancellationReason {
        CancellationReason::by_user("user-1", text)
    }

    #[test]
    fn test_first_cancel_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.throw_if_cancelled().is_ok());

        assert!(token.cancel(user_reason("first")));
        assert!(!token.cancel(user_reason("second")));

        let err = token.throw_if_cancelled().unwrap_err();
        assert_eq!(err.reason.reason, "first");
        assert_eq!(err.reason.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_throw_carries_exact_reason() {
        let token = CancellationToken::new();
        let reason = CancellationReason::new(CancellationInitiator::Policy, "budget exceeded");
        token.cancel(reason.clone());
        assert_eq!(token.throw_if_cancelled().unwrap_err().reason, reason);
    }

    #[test]
    fn test_listener_fires_once() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _reg = token.on_cancelled(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel(user_reason("stop"));
        token.cancel(user_reason("stop again"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_after_cancel_fires_immediately() {
        let token = CancellationToken::new();
        token.cancel(user_reason("stop"));

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _reg = token.on_cancelled(move |reason| {
            assert_eq!(reason.reason, "stop");
            flag.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unsubscribe() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let reg = token.on_cancelled(move |_| flag.store(true, Ordering::SeqCst));
        reg.unsubscribe();

        token.cancel(user_reason("stop"));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_child_inherits_parent_only() {
        let parent = CancellationToken::new();
        let child = parent.create_child();

        child.cancel(user_reason("child only"));
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let parent = CancellationToken::new();
        let child = parent.create_child();
        let grandchild = child.create_child();
        parent.cancel(user_reason("everything"));
        assert_eq!(child.reason().unwrap().reason, "everything");
        assert_eq!(grandchild.reason().unwrap().reason, "everything");
    }

    #[test]
    fn test_child_of_cancelled_parent_is_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel(user_reason("early"));
        assert!(parent.create_child().is_cancelled());
    }

    #[tokio::test]
    async fn test_when_cancelled_resolves_immediately_after_cancel() {
        let token = CancellationToken::new();
        token.cancel(user_reason("done"));
        let reason = tokio::time::timeout(Duration::from_millis(50), token.when_cancelled())
            .await
            .expect("should resolve immediately");
        assert_eq!(reason.reason, "done");
    }

    #[tokio::test]
    async fn test_when_cancelled_waits_for_cancel() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.when_cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel(user_reason("later"));
        assert_eq!(waiter.await.unwrap().reason, "later");
    }

    #[test]
    fn test_source_rejects_cancel_after_dispose() {
        let source = CancellationTokenSource::new();
        source.dispose();
        assert!(source.is_disposed());
        assert!(matches!(
            source.cancel(user_reason("late")),
            Err(CoreError::TokenSourceDisposed)
        ));
        assert!(!source.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_uses_timeout_initiator() {
        let source = CancellationTokenSource::new();
        source.cancel_after(Duration::from_secs(5)).unwrap();

        let reason = source.token().when_cancelled().await;
        assert_eq!(reason.initiator, CancellationInitiator::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_disarms_timer() {
        let source = CancellationTokenSource::new();
        source.cancel_after(Duration::from_secs(1)).unwrap();
        source.dispose();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!source.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_step_checkpoint() {
        let ctx = create_cancellation_context("run-1", "tenant-1");
        let point = create_step_checkpoint(&ctx, "plan");
        assert!(point.check().await.is_ok());

        ctx.cancel(user_reason("abort")).unwrap();
        let err = point.check().await.unwrap_err();
        assert_eq!(err.step.as_deref(), Some("plan"));
        assert_eq!(err.reason.reason, "abort");
        assert!(err.to_string().contains("at step 'plan'"));
    }
}
