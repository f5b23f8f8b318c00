//! Postgres connection pool setup and error mapping.

use quiver_core::config::DatabaseConfig;
use quiver_core::error::{QuiverError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Open a bounded connection pool against the configured database.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    info!(
        max_connections = config.max_connections,
        "Connecting to Postgres"
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| QuiverError::unavailable(format!("connecting to Postgres: {e}")))
}

/// Map a sqlx error onto the platform taxonomy. Connectivity and pool
/// exhaustion are retryable; everything else is a database error.
pub(crate) fn db_err(context: &str, e: sqlx::Error) -> QuiverError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            QuiverError::unavailable(format!("{context}: {e}"))
        }
        other => QuiverError::database(format!("{context}: {other}")),
    }
}

/// Postgres unique-violation, used for at-least-once insert semantics.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}
