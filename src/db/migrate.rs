//! Embedded schema migrator for the `job_queue` table (§6.1).
//!
//! Follows the reference workspace's version-tracked `_migrations` table
//! pattern, but ships a single migration inline rather than reading from a
//! `migrations/` directory, since this crate's entire persistent schema is
//! one table plus its indexes.

use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::{Error, Result};

const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "job_queue",
    r#"
    CREATE TABLE IF NOT EXISTS job_queue (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        data TEXT NOT NULL,
        result TEXT,
        source TEXT,
        metadata TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        last_error TEXT,
        deduplication_key TEXT,
        created_at INTEGER NOT NULL,
        scheduled_for INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_job_queue_dequeue ON job_queue (status, priority, scheduled_for);
    CREATE INDEX IF NOT EXISTS idx_job_queue_type_status ON job_queue (type, status);
    CREATE INDEX IF NOT EXISTS idx_job_queue_source ON job_queue (source);
    "#,
)];

/// Applies `job_queue`'s schema, tracked in a `_migrations` version table.
pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT version FROM _migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|r| r.get::<i64, _>("version")).collect())
    }

    /// Run all pending migrations. Idempotent: a second run is a no-op.
    pub async fn migrate(&self) -> Result<()> {
        self.init_migration_table().await?;
        let applied = self.applied_versions().await?;

        for (version, name, sql) in MIGRATIONS {
            if applied.contains(version) {
                info!(version, name, "migration already applied, skipping");
                continue;
            }

            info!(version, name, "applying migration");
            sqlx::raw_sql(sql).execute(&self.pool).await.map_err(|e| {
                warn!(version, name, error = %e, "migration failed");
                Error::Database(e)
            })?;

            sqlx::query("INSERT INTO _migrations (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(version)
                .bind(*name)
                .bind(chrono::Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }

        Ok(())
    }

    /// Current migration status, for health/readiness checks.
    pub async fn status(&self) -> Result<DbStatus> {
        self.init_migration_table().await?;
        let applied = self.applied_versions().await?;

        let job_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0);

        Ok(DbStatus {
            applied_migrations: applied.len() as i64,
            job_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub applied_migrations: i64,
    pub job_count: i64,
}

/// Run migrations automatically against a freshly constructed pool.
pub async fn auto_migrate(pool: &SqlitePool) -> Result<()> {
    Migrator::new(pool.clone()).migrate().await
}
