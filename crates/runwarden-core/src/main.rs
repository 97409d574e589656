// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runwarden Core - standalone engine process
//!
//! Connects to the run store, reattaches runs this instance owns, recovers
//! orphans left behind by dead instances and sweeps expired idempotency
//! records until interrupted.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use runwarden_core::config::Config;
use runwarden_core::persistence::SqlitePersistence;
use runwarden_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("runwarden_core=info")),
        )
        .init();

    info!("Starting Runwarden Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        owner_id = %config.owner_id,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        stale_threshold_secs = config.stale_threshold.as_secs(),
        recovery_execute = config.recovery_execute,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Database ready, migrations applied");

    let runtime = EngineRuntime::builder()
        .persistence(persistence)
        .owner_id(config.owner_id.clone())
        .heartbeat_interval(config.heartbeat_interval)
        .build()?;

    match runtime
        .run_startup_recovery(&config.recovery_options())
        .await
    {
        Ok(startup) => info!(
            reattached = startup.reattached.len(),
            orphaned = startup.report.orphaned_count,
            resumed = startup.report.resumed_count,
            failed = startup.report.failed_count,
            skipped = startup.report.skipped_count,
            dry_run = startup.report.dry_run,
            "Startup recovery finished"
        ),
        Err(e) => warn!(error = %e, code = e.error_code(), "Startup recovery failed"),
    }

    runtime.start_idempotency_sweep(config.idempotency_sweep_interval);

    info!("Runwarden Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
