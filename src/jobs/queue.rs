//! Queue Service facade (§4.2): the durable enqueue/dequeue/complete/fail
//! contract on top of `JobStore`, with deduplication and handler validation.

use std::sync::Arc;
use uuid::Uuid;

use super::job::{Deduplication, Job, JobContext, JobStatus};
use super::registry::HandlerRegistry;
use super::retry::backoff_delay_ms;
use super::store::{JobStore, QueueStats as StoreStats};
use super::QueueError;

/// Per-call enqueue options (§4.2).
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub source: String,
    pub metadata: JobContext,
    pub priority: i64,
    pub max_retries: u32,
    pub delay_ms: i64,
    pub deduplication: Deduplication,
    pub deduplication_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new(source: impl Into<String>, metadata: JobContext) -> Self {
        Self {
            source: source.into(),
            metadata,
            priority: 0,
            max_retries: 3,
            delay_ms: 0,
            deduplication: Deduplication::None,
            deduplication_key: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: i64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_deduplication(mut self, mode: Deduplication, key: impl Into<String>) -> Self {
        self.deduplication = mode;
        self.deduplication_key = Some(key.into());
        self
    }

    /// Dedup mode with no key: scope is `(type, None)`, matching other
    /// keyless active jobs of the same type (§4.2 "absent key matches other
    /// absent keys").
    pub fn with_deduplication_mode(mut self, mode: Deduplication) -> Self {
        self.deduplication = mode;
        self.deduplication_key = None;
        self
    }
}

pub use StoreStats as QueueStats;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The durable queue façade (§4.2). Cheap to clone: wraps a pooled
/// `JobStore` and a shared handler registry.
#[derive(Clone)]
pub struct QueueService {
    store: JobStore,
    registry: Arc<HandlerRegistry>,
}

impl QueueService {
    pub fn new(store: JobStore, registry: Arc<HandlerRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Enqueue a unit of work. Fails if no handler is registered for `job_type`
    /// or its `validate` rejects `data`. Applies the dedup mode in `options`
    /// against other active jobs sharing `(job_type, deduplication_key)`.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        data: serde_json::Value,
        mut options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let job_type = job_type.into();

        let handler = self
            .registry
            .get_handler(&job_type)
            .ok_or_else(|| QueueError::NoHandler(job_type.clone()))?;
        let data = handler
            .validate_and_parse(&data)
            .ok_or_else(|| QueueError::InvalidJobData("handler rejected job payload".to_string()))?;

        let now = now_ms();

        // Scope is (type, deduplication_key) among active jobs; an absent key
        // matches other absent keys, so dedup applies even when no key was
        // given, not just when one was (§4.2).
        let key = options.deduplication_key.as_deref();
        match options.deduplication {
            Deduplication::None => {}
            Deduplication::Skip => {
                if let Some(existing) = self.store.find_active_duplicate(&job_type, key).await? {
                    if existing.status == JobStatus::Pending {
                        return Ok(existing.id);
                    }
                    // Only a processing match exists; fall through and insert.
                }
            }
            Deduplication::Replace => {
                if let Some(existing) = self.store.find_active_duplicate(&job_type, key).await? {
                    if existing.status == JobStatus::Pending {
                        self.store
                            .fail(&existing.id, "Replaced", existing.retry_count, JobStatus::Failed, now)
                            .await?;
                    }
                }
            }
            Deduplication::Coalesce => {
                if let Some(existing) = self.store.find_active_duplicate(&job_type, key).await? {
                    if existing.status == JobStatus::Pending {
                        self.store.update_data(&existing.id, &data).await?;
                        self.store.reschedule(&existing.id, now).await?;
                        return Ok(existing.id);
                    }
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        if options.metadata.root_job_id.is_none() {
            options.metadata.root_job_id = Some(id.clone());
        }

        let job = Job {
            id: id.clone(),
            job_type,
            data,
            status: JobStatus::Pending,
            priority: options.priority,
            retry_count: 0,
            max_retries: options.max_retries,
            last_error: None,
            result: None,
            source: Some(options.source),
            metadata: options.metadata,
            deduplication_key: options.deduplication_key,
            created_at: now,
            scheduled_for: now + options.delay_ms,
            started_at: None,
            completed_at: None,
        };

        self.store.insert(&job).await?;
        Ok(id)
    }

    pub async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        self.store.dequeue(now_ms()).await
    }

    pub async fn complete(&self, job_id: &str, result: serde_json::Value) -> Result<(), QueueError> {
        self.store.complete(job_id, &result, now_ms()).await
    }

    /// Record a failed attempt. If `retryCount < maxRetries`, increments
    /// `retryCount` and reschedules the job `pending` after an exponential
    /// backoff delay; otherwise marks it `failed` with `retryCount` left
    /// unchanged, preserving the `retryCount <= maxRetries` invariant
    /// (§3.1, §4.2, §8).
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<JobStatus, QueueError> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        let now = now_ms();

        if job.retry_count < job.max_retries {
            let new_retry_count = job.retry_count + 1;
            // Delay is computed after the k-th failure from the post-increment
            // count: `min(1000 * 2^k, 60000)` (§4.2, §8).
            let scheduled_for = now + backoff_delay_ms(new_retry_count);
            self.store
                .fail(job_id, error, new_retry_count, JobStatus::Pending, scheduled_for)
                .await?;
            Ok(JobStatus::Pending)
        } else {
            self.store
                .fail(job_id, error, job.retry_count, JobStatus::Failed, now)
                .await?;
            Ok(JobStatus::Failed)
        }
    }

    /// Mark a job terminally `failed` with no retry, regardless of
    /// `retryCount`/`maxRetries`. Used for the non-recoverable dispatch-time
    /// errors (`NoHandler`, `InvalidJobData`) that §7 classifies as "job
    /// fails immediately" rather than subject to the `fail` retry decision.
    pub async fn fail_terminal(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        self.store
            .fail(job_id, error, job.retry_count, JobStatus::Failed, now_ms())
            .await
    }

    pub async fn update(&self, job_id: &str, data: serde_json::Value) -> Result<(), QueueError> {
        self.store.update_data(job_id, &data).await
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.store.find_by_id(job_id).await
    }

    pub async fn get_status_by_entity_id(&self, entity_id: &str) -> Result<Option<Job>, QueueError> {
        self.store.find_by_entity_id(entity_id).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats().await
    }

    pub async fn get_active_jobs(&self, types: &[String]) -> Result<Vec<Job>, QueueError> {
        self.store.active_jobs(types).await
    }

    pub async fn cleanup(&self, older_than_ms: i64) -> Result<u64, QueueError> {
        self.store.cleanup(now_ms() - older_than_ms).await
    }

    pub async fn reset_stuck_job(&self, job_id: &str) -> Result<(), QueueError> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        if job.status != JobStatus::Processing {
            return Ok(());
        }
        self.store.reset_one_stuck(job_id).await
    }
}

#[async_trait::async_trait]
impl crate::traits::Service for QueueService {
    async fn health_check(&self) -> crate::Result<()> {
        self.store.stats().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::auto_migrate;
    use crate::jobs::job::OperationType;
    use crate::jobs::{JobHandler, ProgressReporter};
    use crate::Result;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn process(
            &self,
            parsed: &serde_json::Value,
            _job_id: &str,
            _reporter: &ProgressReporter,
        ) -> Result<serde_json::Value> {
            Ok(parsed.clone())
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl JobHandler for RejectingHandler {
        fn validate_and_parse(&self, _raw: &serde_json::Value) -> Option<serde_json::Value> {
            None
        }

        async fn process(
            &self,
            _parsed: &serde_json::Value,
            _job_id: &str,
            _reporter: &ProgressReporter,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    async fn service() -> QueueService {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        auto_migrate(&pool).await.unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("site-build", Arc::new(EchoHandler), None);
        registry.register("rejecting", Arc::new(RejectingHandler), None);
        QueueService::new(JobStore::new(pool), registry)
    }

    fn opts() -> EnqueueOptions {
        EnqueueOptions::new("test", JobContext::new(OperationType::DataProcessing))
    }

    #[tokio::test]
    async fn health_check_succeeds_against_a_live_pool() {
        use crate::traits::Service;
        let svc = service().await;
        assert!(svc.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn enqueue_without_handler_fails() {
        let svc = service().await;
        let err = svc
            .enqueue("no-such-type", serde_json::json!({}), opts())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NoHandler(_)));
    }

    #[tokio::test]
    async fn enqueue_with_rejected_payload_fails() {
        let svc = service().await;
        let err = svc
            .enqueue("rejecting", serde_json::json!({}), opts())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidJobData(_)));
    }

    #[tokio::test]
    async fn enqueue_sets_root_job_id_to_self_when_absent() {
        let svc = service().await;
        let id = svc.enqueue("site-build", serde_json::json!({}), opts()).await.unwrap();
        let job = svc.get_status(&id).await.unwrap().unwrap();
        assert_eq!(job.metadata.root_job_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn priority_ordering_breaks_ties_by_age() {
        let svc = service().await;
        let low = svc
            .enqueue("site-build", serde_json::json!({}), opts().with_priority(1))
            .await
            .unwrap();
        let high = svc
            .enqueue("site-build", serde_json::json!({}), opts().with_priority(5))
            .await
            .unwrap();
        let mid = svc
            .enqueue("site-build", serde_json::json!({}), opts().with_priority(3))
            .await
            .unwrap();

        assert_eq!(svc.dequeue().await.unwrap().unwrap().id, high);
        assert_eq!(svc.dequeue().await.unwrap().unwrap().id, mid);
        assert_eq!(svc.dequeue().await.unwrap().unwrap().id, low);
    }

    #[tokio::test]
    async fn delayed_job_is_not_dequeued_until_due() {
        let svc = service().await;
        svc.enqueue("site-build", serde_json::json!({}), opts().with_delay_ms(5_000))
            .await
            .unwrap();
        let immediate = svc.enqueue("site-build", serde_json::json!({}), opts()).await.unwrap();

        let first = svc.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, immediate);
        assert!(svc.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedup_skip_with_no_key_reuses_pending_job_id() {
        // §8 scenario 4: two enqueues with `deduplication: "skip"` and no
        // `deduplicationKey` must collapse to a single active job.
        let svc = service().await;
        let options = opts().with_deduplication_mode(Deduplication::Skip);
        let first = svc.enqueue("site-build", serde_json::json!({}), options.clone()).await.unwrap();
        let second = svc.enqueue("site-build", serde_json::json!({}), options).await.unwrap();

        assert_eq!(first, second);
        let active = svc.get_active_jobs(&["site-build".to_string()]).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn dedup_skip_reuses_pending_job_id() {
        let svc = service().await;
        let options = opts().with_deduplication(Deduplication::Skip, "entity-1");
        let first = svc.enqueue("site-build", serde_json::json!({}), options.clone()).await.unwrap();
        let second = svc.enqueue("site-build", serde_json::json!({}), options).await.unwrap();

        assert_eq!(first, second);
        let active = svc.get_active_jobs(&["site-build".to_string()]).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn dedup_coalesce_bumps_scheduled_for_forward() {
        let svc = service().await;
        let options = opts().with_deduplication(Deduplication::Coalesce, "entity-2");
        let first = svc.enqueue("site-build", serde_json::json!({"n": 1}), options.clone()).await.unwrap();
        let before = svc.get_status(&first).await.unwrap().unwrap().scheduled_for;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = svc.enqueue("site-build", serde_json::json!({"n": 2}), options).await.unwrap();
        let after = svc.get_status(&second).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert!(after.scheduled_for >= before);
        assert_eq!(after.data["n"], 2);
    }

    #[tokio::test]
    async fn dedup_replace_fails_old_pending_job() {
        let svc = service().await;
        let options = opts().with_deduplication(Deduplication::Replace, "entity-3");
        let first = svc.enqueue("site-build", serde_json::json!({}), options.clone()).await.unwrap();
        let second = svc.enqueue("site-build", serde_json::json!({}), options).await.unwrap();

        assert_ne!(first, second);
        let old = svc.get_status(&first).await.unwrap().unwrap();
        assert_eq!(old.status, JobStatus::Failed);
        assert_eq!(old.last_error.as_deref(), Some("Replaced"));
    }

    #[tokio::test]
    async fn fail_schedules_exponential_backoff_until_max_retries() {
        let svc = service().await;
        let id = svc
            .enqueue("site-build", serde_json::json!({}), opts().with_max_retries(2))
            .await
            .unwrap();

        svc.dequeue().await.unwrap();
        let before_first_fail = chrono::Utc::now().timestamp_millis();
        let status = svc.fail(&id, "boom").await.unwrap();
        assert_eq!(status, JobStatus::Pending);
        let job = svc.get_status(&id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 1);
        // Post-increment count (k=1): delay = min(1000 * 2^1, 60000) = 2000ms.
        let delay = job.scheduled_for - before_first_fail;
        assert!((2_000..2_200).contains(&delay), "delay was {delay}ms, expected ~2000ms");

        // second attempt also retries (retry_count 1 < max_retries 2)
        let before_second_fail = chrono::Utc::now().timestamp_millis();
        let status = svc.fail(&id, "boom again").await.unwrap();
        assert_eq!(status, JobStatus::Pending);
        let job = svc.get_status(&id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 2);
        // k=2: delay = min(1000 * 2^2, 60000) = 4000ms.
        let delay = job.scheduled_for - before_second_fail;
        assert!((4_000..4_200).contains(&delay), "delay was {delay}ms, expected ~4000ms");

        // third attempt exhausts retries: terminal, retry_count unchanged
        let status = svc.fail(&id, "boom a third time").await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        let job = svc.get_status(&id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 2);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn fail_with_zero_max_retries_fails_on_first_attempt() {
        let svc = service().await;
        let id = svc
            .enqueue("site-build", serde_json::json!({}), opts().with_max_retries(0))
            .await
            .unwrap();
        svc.dequeue().await.unwrap();

        let status = svc.fail(&id, "boom").await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        let job = svc.get_status(&id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 0);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn get_status_round_trips_enqueued_fields() {
        let svc = service().await;
        let metadata = JobContext::new(OperationType::FileOperations).with_operation_target("entity-9");
        let options = EnqueueOptions::new("cli", metadata.clone()).with_priority(7).with_max_retries(5);
        let id = svc
            .enqueue("site-build", serde_json::json!({"path": "/tmp/x"}), options)
            .await
            .unwrap();

        let job = svc.get_status(&id).await.unwrap().unwrap();
        assert_eq!(job.job_type, "site-build");
        assert_eq!(job.data["path"], "/tmp/x");
        assert_eq!(job.priority, 7);
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.metadata.operation_target.as_deref(), Some("entity-9"));
    }
}
