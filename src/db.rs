//! Database connection pool construction.
//!
//! Unlike the reference workspace's process-global `Lazy<Arc<PgPool>>`, this
//! pool is constructed explicitly by the caller and handed to the
//! `QueueService` at construction time (§9 lifecycle guidance: no lazy
//! static singleton).

pub mod migrate;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::Result;

/// Busy-timeout applied to every connection, per §5's contention guidance.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a connection pool for `config.url`, enabling WAL journal mode and a
/// busy-timeout on every connection (§5, §6.1).
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(if config.url.contains(":memory:") { 1 } else { 10 })
        .connect_with(options)
        .await?;

    info!(url = %config.url, "job queue database pool created");
    Ok(pool)
}
