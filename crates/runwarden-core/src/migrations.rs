// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for runwarden-core.
//!
//! Products embedding runwarden-core with their own pool can apply the schema
//! programmatically:
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use runwarden_core::migrations;
//!
//! let pool = SqlitePool::connect(&database_url).await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all core migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
