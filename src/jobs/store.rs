//! SQL persistence layer backing the queue (§6.1).
//!
//! The dequeue query is the one piece of this module doing something
//! nontrivial: it atomically claims the highest-priority eligible job with a
//! single `UPDATE ... WHERE id = (SELECT ...) RETURNING *`, the same pattern
//! `DatabaseQueueDriver::dequeue` uses (there under `FOR UPDATE SKIP LOCKED`
//! row locking; SQLite is single-writer so the subselect alone is atomic
//! under WAL).

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use super::job::{Job, JobContext, JobStatus};
use super::QueueError;

/// Raw row shape, converted into `Job` after fetch since `metadata` and
/// `status` need decoding that `sqlx::FromRow` can't derive directly.
struct JobRow {
    id: String,
    job_type: String,
    data: String,
    result: Option<String>,
    source: Option<String>,
    metadata: String,
    status: String,
    priority: i64,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    deduplication_key: Option<String>,
    created_at: i64,
    scheduled_for: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status)
            .ok_or_else(|| QueueError::StorageError(format!("unknown job status '{}'", row.status)))?;
        let data: Value = serde_json::from_str(&row.data)
            .map_err(|e| QueueError::StorageError(format!("corrupt job data: {}", e)))?;
        let metadata: JobContext = serde_json::from_str(&row.metadata)
            .map_err(|e| QueueError::StorageError(format!("corrupt job metadata: {}", e)))?;
        let result = row
            .result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| QueueError::StorageError(format!("corrupt job result: {}", e)))?;

        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            data,
            status,
            priority: row.priority,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            last_error: row.last_error,
            result,
            source: row.source,
            metadata,
            deduplication_key: row.deduplication_key,
            created_at: row.created_at,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn row_from_sqlx(row: &sqlx::sqlite::SqliteRow) -> JobRow {
    JobRow {
        id: row.get("id"),
        job_type: row.get("type"),
        data: row.get("data"),
        result: row.get("result"),
        source: row.get("source"),
        metadata: row.get("metadata"),
        status: row.get("status"),
        priority: row.get("priority"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        last_error: row.get("last_error"),
        deduplication_key: row.get("deduplication_key"),
        created_at: row.get("created_at"),
        scheduled_for: row.get("scheduled_for"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    }
}

/// Queue depth counts by status, returned by `JobStore::stats`.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// SQL-backed store for the `job_queue` table. Holds no in-memory state;
/// every call round-trips to the pool, so it is cheap to clone (the pool
/// itself is a connection-pooled handle).
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, job: &Job) -> Result<(), QueueError> {
        let data = serde_json::to_string(&job.data)
            .map_err(|e| QueueError::InvalidJobData(e.to_string()))?;
        let metadata = serde_json::to_string(&job.metadata)
            .map_err(|e| QueueError::InvalidJobData(e.to_string()))?;
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| QueueError::InvalidJobData(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO job_queue (
                id, type, data, result, source, metadata, status, priority,
                retry_count, max_retries, last_error, deduplication_key,
                created_at, scheduled_for, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.job_type)
        .bind(data)
        .bind(result)
        .bind(&job.source)
        .bind(metadata)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(&job.last_error)
        .bind(&job.deduplication_key)
        .bind(job.created_at)
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically claim the highest-priority eligible job
    /// (`ORDER BY priority DESC, created_at ASC`, §4.2 Open Question
    /// resolution) and mark it `processing`.
    pub async fn dequeue(&self, now_ms: i64) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'processing', started_at = ?
            WHERE id = (
                SELECT id FROM job_queue
                WHERE status = 'pending' AND scheduled_for <= ?
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
            )
            RETURNING id, type, data, result, source, metadata, status, priority,
                      retry_count, max_retries, last_error, deduplication_key,
                      created_at, scheduled_for, started_at, completed_at
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Job::try_from(row_from_sqlx(&r))).transpose()
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query("SELECT * FROM job_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Job::try_from(row_from_sqlx(&r))).transpose()
    }

    /// Look up a job by `data.id` (the "entity id" a caller enqueued work
    /// against, JSON-path extracted from the payload), most recent match
    /// wins.
    pub async fn find_by_entity_id(&self, entity_id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM job_queue
            WHERE json_extract(data, '$.id') = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Job::try_from(row_from_sqlx(&r))).transpose()
    }

    /// Find an active (pending/processing) job of `job_type` sharing
    /// `deduplication_key`, for the dedup modes in §4.2. `deduplication_key =
    /// None` matches other jobs with no key set (§4.2: "absent key matches
    /// other absent keys"), not merely jobs of the same type.
    pub async fn find_active_duplicate(
        &self,
        job_type: &str,
        deduplication_key: Option<&str>,
    ) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM job_queue
            WHERE type = ?
              AND (deduplication_key = ? OR (deduplication_key IS NULL AND ? IS NULL))
              AND status IN ('pending', 'processing')
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(job_type)
        .bind(deduplication_key)
        .bind(deduplication_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Job::try_from(row_from_sqlx(&r))).transpose()
    }

    pub async fn complete(&self, id: &str, result: &Value, completed_at: i64) -> Result<(), QueueError> {
        let result_json = serde_json::to_string(result).map_err(|e| QueueError::InvalidJobData(e.to_string()))?;
        let affected = sqlx::query(
            "UPDATE job_queue SET status = 'completed', result = ?, completed_at = ? WHERE id = ?",
        )
        .bind(result_json)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a failed attempt with the already-decided `status` and
    /// `retry_count` (the `retryCount < maxRetries` decision is the Queue
    /// Service's, per §4.2, so `retry_count` here never exceeds
    /// `max_retries`). `status = Pending` reschedules at `scheduled_for`
    /// (the caller computes the backoff delay via `retry::backoff_delay_ms`);
    /// `status = Failed` stamps `completed_at = scheduled_for`.
    pub async fn fail(
        &self,
        id: &str,
        error: &str,
        retry_count: u32,
        status: JobStatus,
        scheduled_for: i64,
    ) -> Result<(), QueueError> {
        let completed_at = if status == JobStatus::Failed {
            Some(scheduled_for)
        } else {
            None
        };

        let affected = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = ?, retry_count = ?, last_error = ?, scheduled_for = ?,
                started_at = NULL, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(retry_count as i64)
        .bind(error)
        .bind(scheduled_for)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Overwrite a pending job's `data`, used by the `coalesce` dedup mode to
    /// merge a newer enqueue's payload into the existing job.
    pub async fn update_data(&self, id: &str, data: &Value) -> Result<(), QueueError> {
        let data_json = serde_json::to_string(data).map_err(|e| QueueError::InvalidJobData(e.to_string()))?;
        sqlx::query("UPDATE job_queue SET data = ? WHERE id = ?")
            .bind(data_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump a pending job's `scheduled_for` forward, used by the `coalesce`
    /// dedup mode.
    pub async fn reschedule(&self, id: &str, scheduled_for: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE job_queue SET scheduled_for = ? WHERE id = ? AND scheduled_for < ?")
            .bind(scheduled_for)
            .bind(id)
            .bind(scheduled_for)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Force a single `processing` job back to `pending`, regardless of age
    /// (the targeted `resetStuckJob(jobId)` escape hatch of §5).
    pub async fn reset_one_stuck(&self, id: &str) -> Result<(), QueueError> {
        let affected = sqlx::query(
            "UPDATE job_queue SET status = 'pending', started_at = NULL
             WHERE id = ? AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Requeue jobs stuck `processing` since before `older_than_ms` (a worker
    /// crashed mid-execution). Returns the number reset.
    pub async fn reset_stuck(&self, older_than_ms: i64) -> Result<u64, QueueError> {
        let affected = sqlx::query(
            "UPDATE job_queue SET status = 'pending', started_at = NULL
             WHERE status = 'processing' AND started_at < ?",
        )
        .bind(older_than_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM job_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.as_str() {
                "pending" => stats.pending = n,
                "processing" => stats.processing = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                _ => {}
            }
            stats.total += n;
        }
        Ok(stats)
    }

    /// All pending/processing jobs, newest first, optionally restricted to
    /// `types`.
    pub async fn active_jobs(&self, types: &[String]) -> Result<Vec<Job>, QueueError> {
        let rows = if types.is_empty() {
            sqlx::query(
                "SELECT * FROM job_queue WHERE status IN ('pending', 'processing') ORDER BY created_at DESC",
            )
            .fetch_all(&self.pool)
            .await?
        } else {
            let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT * FROM job_queue WHERE status IN ('pending', 'processing') AND type IN ({}) ORDER BY created_at DESC",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for t in types {
                query = query.bind(t);
            }
            query.fetch_all(&self.pool).await?
        };

        rows.iter().map(|r| Job::try_from(row_from_sqlx(r))).collect()
    }

    /// Delete terminal jobs completed/failed before `older_than_ms`. Returns
    /// the number removed.
    pub async fn cleanup(&self, older_than_ms: i64) -> Result<u64, QueueError> {
        let affected = sqlx::query(
            "DELETE FROM job_queue WHERE status IN ('completed', 'failed') AND completed_at < ?",
        )
        .bind(older_than_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }
}
