// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runwarden-core.
//!
//! Provides a unified error type with stable machine-readable codes. The state
//! machine and cancellation errors also exist as standalone types so callers can
//! match on them without unwrapping the unified enum.

use thiserror::Error;

use crate::cancellation::CancelledError;
use crate::state_machine::InvalidTransitionError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while orchestrating runs.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found in the store.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Run already exists (duplicate creation).
    #[error("Run '{run_id}' already exists")]
    RunAlreadyExists {
        /// The run ID that already exists.
        run_id: String,
    },

    /// An illegal status change was attempted.
    #[error(transparent)]
    InvalidTransition(Box<InvalidTransitionError>),

    /// A cooperative cancellation point tripped.
    #[error(transparent)]
    Cancelled(Box<CancelledError>),

    /// A duplicate request is currently being processed elsewhere.
    #[error("Request with idempotency key '{key}' is already being processed")]
    IdempotencyProcessing {
        /// The idempotency key in flight.
        key: String,
    },

    /// Waiting for an in-flight duplicate exceeded the timeout.
    #[error("Timed out after {waited_ms}ms waiting for idempotency key '{key}'")]
    IdempotencyTimeout {
        /// The idempotency key waited on.
        key: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A reused idempotency key arrived with a different request payload.
    #[error("Idempotency key '{key}' was reused with a different request payload")]
    IdempotencyConflict {
        /// The reused key.
        key: String,
    },

    /// The idempotency record for a key is missing.
    #[error("Idempotency record '{key}' not found")]
    IdempotencyRecordNotFound {
        /// The key that was looked up.
        key: String,
    },

    /// Heartbeats cannot be started after the service shut down.
    #[error("Heartbeat service for owner '{owner_id}' is shut down")]
    HeartbeatShutdown {
        /// Owner identity of the stopped service.
        owner_id: String,
    },

    /// The caller no longer holds the lease on a run.
    #[error("Owner '{owner_id}' does not hold the lease on run '{run_id}'")]
    LeaseNotHeld {
        /// The run.
        run_id: String,
        /// The owner that tried to act.
        owner_id: String,
    },

    /// A run cannot be resumed.
    #[error("Run '{run_id}' cannot be resumed: {reason}")]
    NotResumable {
        /// The run.
        run_id: String,
        /// Why resumption was refused.
        reason: String,
    },

    /// `execute_compensations` was called a second time.
    #[error("Compensations have already been executed")]
    CompensationAlreadyExecuted,

    /// An action was registered after compensations ran.
    #[error("Cannot register compensation '{action_id}': rollback already executed")]
    CompensationRegistrationClosed {
        /// The rejected action.
        action_id: String,
    },

    /// Two actions were registered under the same id.
    #[error("Compensation action '{action_id}' is already registered")]
    DuplicateCompensation {
        /// The duplicated action id.
        action_id: String,
    },

    /// `cancel` was called on a disposed token source.
    #[error("Cancellation token source has been disposed")]
    TokenSourceDisposed,

    /// A recovery strategy that has no implementation was requested.
    #[error("Recovery strategy '{strategy}' is not supported")]
    UnsupportedRecoveryStrategy {
        /// The requested strategy.
        strategy: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// (De)serialization of a stored payload failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::RunAlreadyExists { .. } => "RUN_ALREADY_EXISTS",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Cancelled(_) => "CANCELLED",
            Self::IdempotencyProcessing { .. } => "IDEMPOTENCY_PROCESSING",
            Self::IdempotencyTimeout { .. } => "IDEMPOTENCY_TIMEOUT",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyRecordNotFound { .. } => "IDEMPOTENCY_RECORD_NOT_FOUND",
            Self::HeartbeatShutdown { .. } => "HEARTBEAT_SHUTDOWN",
            Self::LeaseNotHeld { .. } => "LEASE_NOT_HELD",
            Self::NotResumable { .. } => "NOT_RESUMABLE",
            Self::CompensationAlreadyExecuted => "COMPENSATION_ALREADY_EXECUTED",
            Self::CompensationRegistrationClosed { .. } => "COMPENSATION_REGISTRATION_CLOSED",
            Self::DuplicateCompensation { .. } => "DUPLICATE_COMPENSATION",
            Self::TokenSourceDisposed => "TOKEN_SOURCE_DISPOSED",
            Self::UnsupportedRecoveryStrategy { .. } => "UNSUPPORTED_RECOVERY_STRATEGY",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<InvalidTransitionError> for CoreError {
    fn from(err: InvalidTransitionError) -> Self {
        CoreError::InvalidTransition(Box::new(err))
    }
}

impl From<CancelledError> for CoreError {
    fn from(err: CancelledError) -> Self {
        CoreError::Cancelled(Box::new(err))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
