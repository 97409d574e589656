// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::heartbeat::generate_owner_id;
use crate::recovery::RecoveryOptions;

/// Runwarden Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Identity of this engine instance
    pub owner_id: String,
    /// Time between heartbeat writes
    pub heartbeat_interval: Duration,
    /// Runs without a heartbeat for longer than this are orphans
    pub stale_threshold: Duration,
    /// Maximum orphans handled by one recovery pass
    pub recovery_max_runs: i64,
    /// Apply recovery decisions (false = dry run)
    pub recovery_execute: bool,
    /// Interval of the expired idempotency record sweep
    pub idempotency_sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RUNWARDEN_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `RUNWARDEN_OWNER_ID`: instance identity (default: `instance-{uuid}`)
    /// - `RUNWARDEN_HEARTBEAT_INTERVAL_SECS`: heartbeat interval (default: 30)
    /// - `RUNWARDEN_STALE_THRESHOLD_SECS`: orphan threshold (default: 300)
    /// - `RUNWARDEN_RECOVERY_MAX_RUNS`: orphans per recovery pass (default: 100)
    /// - `RUNWARDEN_RECOVERY_EXECUTE`: apply recovery decisions (default: true)
    /// - `RUNWARDEN_IDEMPOTENCY_SWEEP_SECS`: sweep interval (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNWARDEN_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("RUNWARDEN_DATABASE_URL"))?;

        let owner_id = std::env::var("RUNWARDEN_OWNER_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_owner_id);

        let heartbeat_interval = secs_var("RUNWARDEN_HEARTBEAT_INTERVAL_SECS", 30)?;
        let stale_threshold = secs_var("RUNWARDEN_STALE_THRESHOLD_SECS", 300)?;
        let idempotency_sweep_interval = secs_var("RUNWARDEN_IDEMPOTENCY_SWEEP_SECS", 300)?;

        let recovery_max_runs: i64 = std::env::var("RUNWARDEN_RECOVERY_MAX_RUNS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "RUNWARDEN_RECOVERY_MAX_RUNS",
                "must be a positive integer",
            ))?;

        let recovery_execute = match std::env::var("RUNWARDEN_RECOVERY_EXECUTE")
            .unwrap_or_else(|_| "true".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "RUNWARDEN_RECOVERY_EXECUTE",
                    "must be true or false",
                ));
            }
        };

        if stale_threshold <= heartbeat_interval {
            return Err(ConfigError::Invalid(
                "RUNWARDEN_STALE_THRESHOLD_SECS",
                "must be greater than the heartbeat interval",
            ));
        }

        Ok(Self {
            database_url,
            owner_id,
            heartbeat_interval,
            stale_threshold,
            recovery_max_runs,
            recovery_execute,
            idempotency_sweep_interval,
        })
    }

    /// Recovery options derived from this configuration.
    pub fn recovery_options(&self) -> RecoveryOptions {
        RecoveryOptions {
            stale_threshold: self.stale_threshold,
            max_runs: self.recovery_max_runs,
            execute_resume: self.recovery_execute,
            ..Default::default()
        }
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .ok_or(ConfigError::Invalid(name, "must be a positive number of seconds"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
