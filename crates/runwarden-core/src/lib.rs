// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runwarden Core - Run Orchestration Engine
//!
//! This crate keeps long-running, multi-step runs correct under crashes,
//! duplicate triggers and cancellation. All run state is persisted through a
//! pluggable store so a fresh process can pick up where a dead one stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                 Trigger sources (webhook, cron, API, ...)         │
//! └───────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  IdempotencyService       dedupe triggers, replay stored responses│
//! └───────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────┐   ┌──────────────────┐   ┌────────────────────┐
//! │   RunManager     │   │  ResumeService   │   │ HeartbeatService   │
//! │  state machine   │   │  checkpoint log  │   │  owner leases      │
//! └──────────────────┘   └──────────────────┘   └────────────────────┘
//!           │                      │                      │
//!           └──────────────┬───────┴──────────────────────┘
//!                          ▼
//!               ┌───────────────────────┐
//!               │ RecoveryOrchestrator  │  orphan scan → resume | fail
//!               └───────────────────────┘
//!                          │
//!                          ▼
//!               ┌───────────────────────┐
//!               │  Persistence          │  SQLite or in-memory
//!               └───────────────────────┘
//! ```
//!
//! # Run lifecycle
//!
//! | From | Allowed next statuses |
//! |------|-----------------------|
//! | `pending` | `running`, `cancelled`, `failed` |
//! | `running` | `completed`, `failed`, `cancelled`, `awaiting_approval`, `waiting_external` |
//! | `awaiting_approval` | `running`, `completed`, `failed`, `cancelled` |
//! | `waiting_external` | `running`, `completed`, `failed`, `cancelled` |
//! | `completed`, `failed`, `cancelled` | none |
//!
//! # Leases
//!
//! A run in flight is owned by one engine instance. The owner refreshes
//! `last_heartbeat_at`; other instances treat runs whose heartbeat is older
//! than the stale threshold as orphans. Takeover bumps `lease_epoch`, and a
//! heartbeat carrying an old epoch is rejected, so a paused previous owner
//! cannot overwrite the new one.
//!
//! # Embedding
//!
//! Use [`runtime::EngineRuntime`] to wire every service over one backend.
//! The `runwarden-core` binary does the same driven by [`config::Config`].

#![warn(missing_docs)]

/// Cooperative cancellation tokens, sources and checkpoints.
pub mod cancellation;

/// Checkpoint-based resume planning.
pub mod checkpoint;

/// Saga-style compensation registry.
pub mod compensation;

/// Process configuration loaded from environment variables.
pub mod config;

/// Error types with stable machine-readable codes.
pub mod error;

/// Owner heartbeats and orphan detection.
pub mod heartbeat;

/// Trigger deduplication and idempotency keys.
pub mod idempotency;

/// Embedded SQLite migrations.
pub mod migrations;

/// Storage traits and their SQLite and in-memory backends.
pub mod persistence;

/// Orphaned run recovery.
pub mod recovery;

/// Run lifecycle management.
pub mod run_manager;

/// Service wiring for embedding the engine.
pub mod runtime;

/// Run status state machine.
pub mod state_machine;

pub use error::{CoreError, Result};
pub use persistence::{InMemoryPersistence, Persistence, SqlitePersistence};
pub use run_manager::RunManager;
pub use runtime::{EngineRuntime, EngineRuntimeBuilder};
pub use state_machine::RunStatus;
