// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent trigger processing.
//!
//! Every trigger (webhook delivery, API call, chat command, scheduler tick) is
//! claimed under a source-specific key before any work happens. The claim is an
//! atomic check-and-set in the [`IdempotencyStore`]; the service layers TTLs,
//! payload checks, and the [`IdempotencyService::process`] wrapper on top.
//!
//! Record lifecycle:
//!
//! ```text
//! (absent) ──claim──► processing ──► completed   (cached for completed_ttl)
//!                         │     └──► failed      (re-claimable)
//!                         └── lock lapses ──► re-claimable
//! ```

mod keys;

pub use self::keys::{
    IdempotencyKeyInput, MAX_KEY_LENGTH, TriggerSource, generate_idempotency_key, hash_request,
    parse_idempotency_key, scheduler_execution_slot,
};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{ClaimOutcome, ClaimRequest, IdempotencyRecord, IdempotencyStatus, IdempotencyStore};

/// What to do when a reused key arrives with a different payload hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadMismatchPolicy {
    /// Log a warning and treat the request as a duplicate.
    #[default]
    Accept,
    /// Fail with `IdempotencyConflict`.
    Reject,
}

/// Idempotency TTLs and polling behaviour.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a completed response is served from cache.
    pub completed_ttl: Duration,
    /// How long a failed record is kept (it stays re-claimable throughout).
    pub failed_ttl: Duration,
    /// How long a processing claim blocks other claimers.
    pub processing_lock_ttl: Duration,
    /// Poll interval while waiting on an in-flight duplicate.
    pub poll_interval: Duration,
    /// Default wait limit for [`ProcessOptions::wait_for_processing`].
    pub wait_timeout: Duration,
    /// Policy for payload mismatches on reused keys.
    pub payload_mismatch: PayloadMismatchPolicy,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            completed_ttl: Duration::from_secs(24 * 60 * 60),
            failed_ttl: Duration::from_secs(60 * 60),
            processing_lock_ttl: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(30),
            payload_mismatch: PayloadMismatchPolicy::Accept,
        }
    }
}

/// Outcome of [`IdempotencyService::check_and_set`].
#[derive(Debug, Clone, PartialEq)]
pub enum CheckResult {
    /// The caller claimed the key and must do the work.
    New {
        /// The freshly claimed record.
        record: IdempotencyRecord,
    },
    /// The work already completed; serve the cached response.
    Duplicate {
        /// Cached response.
        response: serde_json::Value,
        /// Run created by the original request.
        run_id: Option<String>,
        /// The completed record.
        record: IdempotencyRecord,
    },
    /// Another claim is still working on the key.
    Processing {
        /// The in-flight record.
        record: IdempotencyRecord,
    },
}

/// Options for [`IdempotencyService::process`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Poll an in-flight duplicate instead of failing immediately.
    pub wait_for_processing: bool,
    /// Overrides [`IdempotencyConfig::wait_timeout`].
    pub wait_timeout: Option<Duration>,
}

impl ProcessOptions {
    /// Wait for in-flight duplicates with the configured timeout.
    pub fn wait() -> Self {
        Self {
            wait_for_processing: true,
            wait_timeout: None,
        }
    }
}

/// A handler result that can be cached as the idempotent response.
pub trait IdempotentResponse: Serialize + DeserializeOwned {
    /// Run created while producing this response, if any.
    fn run_id(&self) -> Option<String> {
        None
    }
}

impl IdempotentResponse for serde_json::Value {
    fn run_id(&self) -> Option<String> {
        self.get("run_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }
}

fn ttl(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Idempotency service over an [`IdempotencyStore`].
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    /// Create a service with default TTLs.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self::with_config(store, IdempotencyConfig::default())
    }

    /// Create a service with explicit configuration.
    pub fn with_config(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    /// Active configuration.
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Atomically claim `key`, or report what currently holds it.
    ///
    /// A key reused by a different tenant is always a conflict. A different
    /// payload under the same key follows [`PayloadMismatchPolicy`].
    pub async fn check_and_set(
        &self,
        key: &str,
        tenant_id: &str,
        payload: &serde_json::Value,
    ) -> Result<CheckResult> {
        let source = parse_idempotency_key(key)?.source();
        let now = Utc::now();
        let request = ClaimRequest {
            key: key.to_string(),
            source,
            tenant_id: tenant_id.to_string(),
            request_hash: hash_request(payload),
            now,
            lock_expires_at: now + ttl(self.config.processing_lock_ttl),
            expires_at: now + ttl(self.config.completed_ttl),
        };

        let record = match self.store.check_and_set(&request).await? {
            ClaimOutcome::Claimed(record) => {
                if record.attempts > 1 {
                    info!(key = %key, tenant_id = %tenant_id, attempts = record.attempts, "Idempotency key re-claimed");
                } else {
                    debug!(key = %key, tenant_id = %tenant_id, "Idempotency key claimed");
                }
                return Ok(CheckResult::New { record });
            }
            ClaimOutcome::Existing(record) => record,
        };

        if record.tenant_id != tenant_id {
            warn!(
                key = %key,
                tenant_id = %tenant_id,
                owner_tenant = %record.tenant_id,
                "Idempotency key reused across tenants"
            );
            return Err(CoreError::IdempotencyConflict {
                key: key.to_string(),
            });
        }

        if record.request_hash != request.request_hash {
            match self.config.payload_mismatch {
                PayloadMismatchPolicy::Reject => {
                    warn!(key = %key, tenant_id = %tenant_id, "Idempotency payload mismatch rejected");
                    return Err(CoreError::IdempotencyConflict {
                        key: key.to_string(),
                    });
                }
                PayloadMismatchPolicy::Accept => {
                    warn!(key = %key, tenant_id = %tenant_id, "Idempotency key reused with a different payload");
                }
            }
        }

        Ok(match record.status {
            IdempotencyStatus::Completed => {
                debug!(key = %key, "Serving cached idempotent response");
                CheckResult::Duplicate {
                    response: record.response.clone().unwrap_or(serde_json::Value::Null),
                    run_id: record.run_id.clone(),
                    record,
                }
            }
            IdempotencyStatus::Processing | IdempotencyStatus::Failed => {
                CheckResult::Processing { record }
            }
        })
    }

    /// Record the response of a claimed key.
    pub async fn mark_completed(
        &self,
        key: &str,
        response: &serde_json::Value,
        run_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        self.store
            .mark_completed(key, response, run_id, now + ttl(self.config.completed_ttl), now)
            .await?;
        debug!(key = %key, run_id = ?run_id, "Idempotency key completed");
        Ok(())
    }

    /// Record a failure so the key can be retried.
    pub async fn mark_failed(&self, key: &str, error: &str) -> Result<()> {
        let now = Utc::now();
        self.store
            .mark_failed(key, error, now + ttl(self.config.failed_ttl), now)
            .await?;
        debug!(key = %key, error = %error, "Idempotency key failed");
        Ok(())
    }

    /// Fetch the record for `key`.
    pub async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.store.get_record(key).await
    }

    /// Delete expired records; returns how many were removed.
    pub async fn cleanup(&self) -> Result<u64> {
        self.cleanup_at(Utc::now()).await
    }

    async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = self.store.cleanup_expired(now).await?;
        if removed > 0 {
            info!(removed, "Expired idempotency records removed");
        }
        Ok(removed)
    }

    /// Run `handler` at most once per key and cache its result.
    ///
    /// Duplicates get the cached response deserialized back into `T`. An
    /// in-flight duplicate fails with `IdempotencyProcessing` unless
    /// `wait_for_processing` is set, in which case the claim is retried every
    /// poll interval until it completes, becomes claimable, or the wait times
    /// out with `IdempotencyTimeout`.
    pub async fn process<T, E, F, Fut>(
        &self,
        key: &str,
        tenant_id: &str,
        payload: &serde_json::Value,
        options: ProcessOptions,
        handler: F,
    ) -> std::result::Result<T, E>
    where
        T: IdempotentResponse,
        E: From<CoreError> + fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let wait_timeout = options.wait_timeout.unwrap_or(self.config.wait_timeout);
        let started = tokio::time::Instant::now();
        let deadline = started + wait_timeout;

        loop {
            match self.check_and_set(key, tenant_id, payload).await? {
                CheckResult::New { .. } => return self.run_handler(key, handler).await,
                CheckResult::Duplicate { response, .. } => {
                    return serde_json::from_value(response)
                        .map_err(|e| E::from(CoreError::from(e)));
                }
                CheckResult::Processing { .. } => {
                    if !options.wait_for_processing {
                        return Err(CoreError::IdempotencyProcessing {
                            key: key.to_string(),
                        }
                        .into());
                    }
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        warn!(key = %key, "Timed out waiting for in-flight duplicate");
                        return Err(CoreError::IdempotencyTimeout {
                            key: key.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        }
                        .into());
                    }
                    debug!(key = %key, "Duplicate in flight, polling");
                    tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
                }
            }
        }
    }

    async fn run_handler<T, E, F, Fut>(&self, key: &str, handler: F) -> std::result::Result<T, E>
    where
        T: IdempotentResponse,
        E: From<CoreError> + fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match handler().await {
            Ok(value) => {
                let response = serde_json::to_value(&value).map_err(CoreError::from)?;
                let run_id = value.run_id();
                self.mark_completed(key, &response, run_id.as_deref()).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(mark_err) = self.mark_failed(key, &err.to_string()).await {
                    error!(key = %key, error = %mark_err, "Failed to record idempotency failure");
                }
                Err(err)
            }
        }
    }

    /// Spawn a loop that calls [`cleanup`](Self::cleanup) every `interval`
    /// until `shutdown` fires.
    pub fn spawn_cleanup(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        debug!("Idempotency cleanup loop stopped");
                        break;
                    }

                    _ = ticker.tick() => {
                        if let Err(e) = service.cleanup().await {
                            warn!(error = %e, "Idempotency cleanup failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(config: IdempotencyConfig) -> IdempotencyService {
        IdempotencyService::with_config(Arc::new(InMemoryPersistence::new()), config)
    }

    fn fast_config() -> IdempotencyConfig {
        IdempotencyConfig {
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Created {
        run_id: String,
    }

    impl IdempotentResponse for Created {
        fn run_id(&self) -> Option<String> {
            Some(self.run_id.clone())
        }
    }

    #[tokio::test]
    async fn test_check_and_set_lifecycle() {
        let svc = service(IdempotencyConfig::default());
        let payload = json!({"action": "opened"});

        let first = svc.check_and_set("webhook:d-1", "t1", &payload).await.unwrap();
        assert!(matches!(first, CheckResult::New { .. }));

        let second = svc.check_and_set("webhook:d-1", "t1", &payload).await.unwrap();
        assert!(matches!(second, CheckResult::Processing { .. }));

        svc.mark_completed("webhook:d-1", &json!({"run_id": "r-1"}), Some("r-1"))
            .await
            .unwrap();
        let third = svc.check_and_set("webhook:d-1", "t1", &payload).await.unwrap();
        let CheckResult::Duplicate { response, run_id, .. } = third else {
            panic!("expected duplicate");
        };
        assert_eq!(response, json!({"run_id": "r-1"}));
        assert_eq!(run_id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_failed_key_is_reclaimable() {
        let svc = service(IdempotencyConfig::default());
        let payload = json!({});

        svc.check_and_set("api:c:r", "t1", &payload).await.unwrap();
        svc.mark_failed("api:c:r", "boom").await.unwrap();

        let retry = svc.check_and_set("api:c:r", "t1", &payload).await.unwrap();
        let CheckResult::New { record } = retry else {
            panic!("failed key should be reclaimable");
        };
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_tenant_mismatch_is_conflict() {
        let svc = service(IdempotencyConfig::default());
        svc.check_and_set("api:c:r", "t1", &json!({})).await.unwrap();
        let err = svc.check_and_set("api:c:r", "t2", &json!({})).await.unwrap_err();
        assert_eq!(err.error_code(), "IDEMPOTENCY_CONFLICT");
    }

    #[tokio::test]
    async fn test_payload_mismatch_policies() {
        let accept = service(IdempotencyConfig::default());
        accept.check_and_set("api:c:r", "t1", &json!({"a": 1})).await.unwrap();
        let result = accept
            .check_and_set("api:c:r", "t1", &json!({"a": 2}))
            .await
            .unwrap();
        assert!(matches!(result, CheckResult::Processing { .. }));

        let reject = service(IdempotencyConfig {
            payload_mismatch: PayloadMismatchPolicy::Reject,
            ..Default::default()
        });
        reject.check_and_set("api:c:r", "t1", &json!({"a": 1})).await.unwrap();
        let err = reject
            .check_and_set("api:c:r", "t1", &json!({"a": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::IdempotencyConflict { .. }));
    }

    #[tokio::test]
    async fn test_malformed_key_rejected() {
        let svc = service(IdempotencyConfig::default());
        let err = svc.check_and_set("bogus", "t1", &json!({})).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_process_runs_handler_once() {
        let svc = service(fast_config());
        let calls = AtomicUsize::new(0);
        let payload = json!({"issue": 7});

        for _ in 0..3 {
            let result: std::result::Result<Created, CoreError> = svc
                .process("webhook:d-7", "t1", &payload, ProcessOptions::default(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Created {
                        run_id: "run-7".to_string(),
                    })
                })
                .await;
            assert_eq!(result.unwrap().run_id, "run-7");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = svc.get_record("webhook:d-7").await.unwrap().unwrap();
        assert_eq!(record.run_id.as_deref(), Some("run-7"));
        assert_eq!(record.status, IdempotencyStatus::Completed);
    }

    #[tokio::test]
    async fn test_process_failure_allows_retry() {
        let svc = service(fast_config());
        let payload = json!({});

        let failed: std::result::Result<Created, CoreError> = svc
            .process("api:c:r1", "t1", &payload, ProcessOptions::default(), || async {
                Err(CoreError::validation("input", "bad"))
            })
            .await;
        assert!(failed.is_err());
        let record = svc.get_record("api:c:r1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);

        let retried: std::result::Result<Created, CoreError> = svc
            .process("api:c:r1", "t1", &payload, ProcessOptions::default(), || async {
                Ok(Created {
                    run_id: "run-1".to_string(),
                })
            })
            .await;
        assert_eq!(retried.unwrap().run_id, "run-1");
    }

    #[tokio::test]
    async fn test_process_in_flight_without_wait() {
        let svc = service(fast_config());
        svc.check_and_set("api:c:r2", "t1", &json!({})).await.unwrap();

        let result: std::result::Result<serde_json::Value, CoreError> = svc
            .process("api:c:r2", "t1", &json!({}), ProcessOptions::default(), || async {
                Ok(json!({}))
            })
            .await;
        assert!(matches!(
            result,
            Err(CoreError::IdempotencyProcessing { .. })
        ));
    }

    #[tokio::test]
    async fn test_process_wait_times_out() {
        let svc = service(fast_config());
        svc.check_and_set("api:c:r3", "t1", &json!({})).await.unwrap();

        let result: std::result::Result<serde_json::Value, CoreError> = svc
            .process(
                "api:c:r3",
                "t1",
                &json!({}),
                ProcessOptions {
                    wait_for_processing: true,
                    wait_timeout: Some(Duration::from_millis(50)),
                },
                || async { Ok(json!({})) },
            )
            .await;
        let Err(CoreError::IdempotencyTimeout { waited_ms, .. }) = result else {
            panic!("expected timeout");
        };
        assert!(waited_ms >= 50);
    }

    #[tokio::test]
    async fn test_process_wait_sees_completion() {
        let svc = service(fast_config());
        svc.check_and_set("api:c:r4", "t1", &json!({})).await.unwrap();

        let finisher = svc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            finisher
                .mark_completed("api:c:r4", &json!({"run_id": "run-4"}), Some("run-4"))
                .await
                .unwrap();
        });

        let calls = AtomicUsize::new(0);
        let result: std::result::Result<serde_json::Value, CoreError> = svc
            .process("api:c:r4", "t1", &json!({}), ProcessOptions::wait(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            })
            .await;
        assert_eq!(result.unwrap().run_id().as_deref(), Some("run-4"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired() {
        let svc = service(IdempotencyConfig::default());
        svc.check_and_set("webhook:old", "t1", &json!({})).await.unwrap();
        svc.mark_failed("webhook:old", "boom").await.unwrap();

        assert_eq!(svc.cleanup().await.unwrap(), 0);
        let removed = svc
            .cleanup_at(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_loop_stops_on_shutdown() {
        let svc = service(IdempotencyConfig::default());
        let shutdown = CancellationToken::new();
        let handle = svc.spawn_cleanup(Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(25)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
