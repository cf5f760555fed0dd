//! Progress Monitor & Reporter (§4.5): broadcasts job/batch lifecycle events
//! to the message bus on channel `"job-progress"`.
//!
//! Event-driven, not polling, per §9's design note on the source's evolution
//! from polling monitors to hooks: the Worker Pool and handlers call these
//! entry points directly rather than the monitor scanning state on a timer.
//! The per-job rate/ETA bookkeeping uses a bounded `lru::LruCache`, the same
//! "don't let an unbounded map of job ids grow forever" idiom `jobs/metrics.rs`
//! uses for its summary window.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;

use super::batch::{BatchManager, BatchStatus};
use super::job::{Job, JobContext, JobStatus};
use super::queue::QueueService;
use super::QueueError;
use crate::bus::{send_event, MessageBus};

/// Channel every progress/completion/failure event is broadcast on (§6.2).
pub const PROGRESS_CHANNEL: &str = "job-progress";
const SENDER_ID: &str = "job-progress-monitor";

/// How many jobs' last-report bookkeeping (for rate/ETA) to retain at once.
const RATE_CACHE_CAPACITY: usize = 2048;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Progress update a handler hands to its `ProgressReporter` (§4.1, §4.5).
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub progress: u64,
    pub total: Option<u64>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(progress: u64) -> Self {
        Self {
            progress,
            total: None,
            message: None,
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Whether a broadcast event describes a single job or a batch rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    Job,
    Batch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetails {
    pub current: u64,
    pub total: Option<u64>,
    pub percentage: Option<f64>,
    pub rate: Option<f64>,
    pub eta_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetails {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub current_operation: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub job_type: String,
    pub priority: i64,
    pub retry_count: u32,
}

/// A broadcast notification describing a job or batch's current state
/// (§3.1). Emitted only by the `ProgressMonitor`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub status: String,
    pub message: Option<String>,
    pub operation: Option<String>,
    pub progress: Option<ProgressDetails>,
    pub batch_details: Option<BatchDetails>,
    pub job_details: Option<JobDetails>,
    pub metadata: JobContext,
}

/// Lightweight per-job handle bound to a job id, handed to handlers via
/// `process(parsed, job_id, reporter)` (§4.1, §9 design note: constructed
/// fresh per dispatch rather than stored globally).
pub struct ProgressReporter {
    job_id: String,
    monitor: Arc<ProgressMonitor>,
}

impl ProgressReporter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Forward a progress update to the monitor with this reporter's job id
    /// already bound (§4.5).
    pub async fn report(&self, update: ProgressUpdate) -> Result<(), QueueError> {
        self.monitor.report(&self.job_id, update).await
    }
}

/// Broadcasts job and batch lifecycle events (§4.5). Holds the queue (to
/// look up routing metadata) and the batch manager (to compute rollups on
/// `handleJobStatusChange`/`emitBatchProgress`).
pub struct ProgressMonitor {
    bus: Arc<dyn MessageBus>,
    queue: QueueService,
    batches: Arc<BatchManager>,
    last_report: Mutex<LruCache<String, (i64, u64)>>,
}

impl ProgressMonitor {
    pub fn new(bus: Arc<dyn MessageBus>, queue: QueueService, batches: Arc<BatchManager>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            queue,
            batches,
            last_report: Mutex::new(LruCache::new(
                NonZeroUsize::new(RATE_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        })
    }

    /// Build a scoped reporter for one job dispatch (§4.5 `createProgressReporter`).
    pub fn create_reporter(self: &Arc<Self>, job_id: impl Into<String>) -> ProgressReporter {
        ProgressReporter {
            job_id: job_id.into(),
            monitor: self.clone(),
        }
    }

    /// Rate (units/sec) and ETA (ms) since the previous report for this job,
    /// if both a previous sample and a `total` are available. Always records
    /// the current sample for the next call.
    fn rate_and_eta(&self, job_id: &str, progress: u64, total: Option<u64>, now: i64) -> (Option<f64>, Option<i64>) {
        let mut cache = self.last_report.lock().unwrap();
        let previous = cache.get(job_id).copied();
        cache.put(job_id.to_string(), (now, progress));

        let (Some((prev_ts, prev_progress)), Some(total)) = (previous, total) else {
            return (None, None);
        };

        let elapsed_ms = (now - prev_ts).max(1) as f64;
        let delta = progress.saturating_sub(prev_progress);
        if delta == 0 {
            return (None, None);
        }

        let rate = delta as f64 / (elapsed_ms / 1000.0);
        let remaining = total.saturating_sub(progress);
        let eta_ms = if rate > 0.0 {
            Some(((remaining as f64 / rate) * 1000.0) as i64)
        } else {
            None
        };
        (Some(rate), eta_ms)
    }

    /// Entry point handlers reach through `ProgressReporter::report` (§4.5).
    /// Looks up the job's metadata for routing; if the job is a batch member
    /// (`rootJobId != jobId`) the individual event is suppressed in favor of
    /// a batch rollup event.
    pub async fn report(&self, job_id: &str, update: ProgressUpdate) -> Result<(), QueueError> {
        let job = self
            .queue
            .get_status(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if job.is_batch_member() {
            if let Some(root) = job.metadata.root_job_id.clone() {
                self.emit_batch_progress(&root, &job.metadata).await?;
            }
            return Ok(());
        }

        let now = now_ms();
        let (rate, eta_ms) = self.rate_and_eta(job_id, update.progress, update.total, now);
        let percentage = update
            .total
            .filter(|total| *total > 0)
            .map(|total| (update.progress as f64 / total as f64) * 100.0);

        let event = JobProgressEvent {
            id: job_id.to_string(),
            event_type: ProgressEventType::Job,
            status: JobStatus::Processing.as_str().to_string(),
            message: update.message,
            operation: None,
            progress: Some(ProgressDetails {
                current: update.progress,
                total: update.total,
                percentage,
                rate,
                eta_ms,
            }),
            batch_details: None,
            job_details: None,
            metadata: job.metadata,
        };

        self.publish(event).await
    }

    /// Emit a `type = batch` event carrying the batch's current aggregate
    /// status (§4.5 `emitBatchProgress`).
    pub async fn emit_batch_progress(&self, batch_id: &str, metadata: &JobContext) -> Result<(), QueueError> {
        let Some(report) = self.batches.get_batch_status(batch_id).await? else {
            return Ok(());
        };

        let status = match report.status {
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };

        let event = JobProgressEvent {
            id: batch_id.to_string(),
            event_type: ProgressEventType::Batch,
            status: status.to_string(),
            message: None,
            operation: report.current_operation.clone(),
            progress: None,
            batch_details: Some(BatchDetails {
                total_operations: report.total_operations,
                completed_operations: report.completed_operations,
                failed_operations: report.failed_operations,
                current_operation: report.current_operation,
                errors: report.errors,
            }),
            job_details: None,
            metadata: metadata.clone(),
        };

        self.publish(event).await
    }

    /// Called by the Worker Pool on a terminal transition (§4.5
    /// `handleJobStatusChange`). `job` must already carry its final
    /// (persisted) status; anything non-terminal is a no-op.
    pub async fn handle_job_status_change(&self, job: &Job) -> Result<(), QueueError> {
        if job.is_batch_member() {
            if let Some(root) = job.metadata.root_job_id.clone() {
                self.emit_batch_progress(&root, &job.metadata).await?;
            }
            return Ok(());
        }

        let status = match job.status {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            _ => return Ok(()),
        };

        let event = JobProgressEvent {
            id: job.id.clone(),
            event_type: ProgressEventType::Job,
            status: status.to_string(),
            message: job.last_error.clone(),
            operation: None,
            progress: None,
            batch_details: None,
            job_details: Some(JobDetails {
                job_type: job.job_type.clone(),
                priority: job.priority,
                retry_count: job.retry_count,
            }),
            metadata: job.metadata.clone(),
        };

        self.publish(event).await
    }

    async fn publish(&self, event: JobProgressEvent) -> Result<(), QueueError> {
        send_event(self.bus.as_ref(), PROGRESS_CHANNEL, &event, SENDER_ID)
            .await
            .map_err(|e| QueueError::StorageError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalMessageBus;
    use crate::db::migrate::auto_migrate;
    use crate::jobs::batch::{BatchOperation, BatchOptions};
    use crate::jobs::job::OperationType;
    use crate::jobs::registry::HandlerRegistry;
    use crate::jobs::store::JobStore;
    use crate::jobs::{EnqueueOptions, JobHandler, ProgressReporter as Reporter};
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
            _reporter: &Reporter,
        ) -> Result<serde_json::Value> {
            Ok(parsed.clone())
        }
    }

    async fn harness() -> (QueueService, Arc<BatchManager>, Arc<ProgressMonitor>, Arc<LocalMessageBus>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        auto_migrate(&pool).await.unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("site-build", Arc::new(EchoHandler), None);
        let queue = QueueService::new(JobStore::new(pool), registry);
        let batches = Arc::new(BatchManager::new(queue.clone()));
        let bus = Arc::new(LocalMessageBus::new());
        let monitor = ProgressMonitor::new(bus.clone(), queue.clone(), batches.clone());
        (queue, batches, monitor, bus)
    }

    #[tokio::test]
    async fn standalone_job_progress_reports_percentage() {
        let (queue, _batches, monitor, bus) = harness().await;
        let mut sub = bus.subscribe(PROGRESS_CHANNEL);

        let id = queue
            .enqueue(
                "site-build",
                serde_json::json!({}),
                EnqueueOptions::new("test", JobContext::new(OperationType::DataProcessing)),
            )
            .await
            .unwrap();

        let reporter = monitor.create_reporter(id.clone());
        reporter.report(ProgressUpdate::new(1).with_total(10)).await.unwrap();
        reporter.report(ProgressUpdate::new(5).with_total(10)).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.payload["status"], "processing");
        assert_eq!(first.payload["progress"]["percentage"], 10.0);

        let second = sub.recv().await.unwrap();
        assert_eq!(second.payload["progress"]["percentage"], 50.0);
    }

    #[tokio::test]
    async fn batch_member_progress_is_suppressed_in_favor_of_batch_event() {
        let (queue, batches, monitor, bus) = harness().await;
        let mut sub = bus.subscribe(PROGRESS_CHANNEL);

        let batch_id = batches
            .enqueue_batch(
                vec![BatchOperation::new("site-build", serde_json::json!({}))],
                "test",
                JobContext::new(OperationType::BatchProcessing),
                BatchOptions::default(),
            )
            .await
            .unwrap();
        let batch = batches.get_batch_status(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.total_operations, 1);

        let member_job = queue.get_active_jobs(&[]).await.unwrap().remove(0);
        let reporter = monitor.create_reporter(member_job.id.clone());
        reporter.report(ProgressUpdate::new(1).with_total(2)).await.unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload["type"], "batch");
        assert_eq!(event.payload["id"], batch_id);
    }

    #[tokio::test]
    async fn terminal_status_change_emits_job_details() {
        let (queue, _batches, monitor, bus) = harness().await;
        let mut sub = bus.subscribe(PROGRESS_CHANNEL);

        let id = queue
            .enqueue(
                "site-build",
                serde_json::json!({}),
                EnqueueOptions::new("test", JobContext::new(OperationType::DataProcessing)).with_priority(9),
            )
            .await
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.complete(&id, serde_json::json!({"ok": true})).await.unwrap();
        let job = queue.get_status(&id).await.unwrap().unwrap();

        monitor.handle_job_status_change(&job).await.unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload["status"], "completed");
        assert_eq!(event.payload["jobDetails"]["priority"], 9);
    }

    #[tokio::test]
    async fn non_terminal_status_change_is_a_no_op() {
        let (queue, _batches, monitor, bus) = harness().await;
        let mut sub = bus.subscribe(PROGRESS_CHANNEL);

        let id = queue
            .enqueue(
                "site-build",
                serde_json::json!({}),
                EnqueueOptions::new("test", JobContext::new(OperationType::DataProcessing)),
            )
            .await
            .unwrap();
        let job = queue.get_status(&id).await.unwrap().unwrap();

        monitor.handle_job_status_change(&job).await.unwrap();
        assert!(sub.try_recv().is_none());
    }
}
