//! Batch Manager (§4.4): groups related jobs without a dedicated job type.
//!
//! The batch table is process-local in-memory state, the same `DashMap`
//! registry idiom used by the handler registry and the message bus's
//! subscriber map — batches don't need to survive a process restart, only
//! the member jobs (already durable in `job_queue`) do.

use dashmap::DashMap;
use uuid::Uuid;

use super::job::JobStatus;
use super::queue::{EnqueueOptions, QueueService};
use super::JobContext;
use super::QueueError;

/// One `{type, data}` unit submitted as part of a batch.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub job_type: String,
    pub data: serde_json::Value,
}

impl BatchOperation {
    pub fn new(job_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            data,
        }
    }
}

/// Record of a submitted batch, kept for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub job_ids: Vec<String>,
    pub operations: Vec<BatchOperation>,
    pub source: String,
    pub metadata: JobContext,
    pub started_at: i64,
}

/// Aggregate status over a batch's member jobs (§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BatchStatusReport {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub pending_operations: usize,
    pub processing_operations: usize,
    pub status: BatchStatus,
    pub errors: Vec<String>,
    pub current_operation: Option<String>,
}

/// Options shared by every member job of a batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub priority: i64,
    pub max_retries: u32,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct BatchManager {
    batches: DashMap<String, Batch>,
    queue: QueueService,
}

impl BatchManager {
    pub fn new(queue: QueueService) -> Self {
        Self {
            batches: DashMap::new(),
            queue,
        }
    }

    /// Enqueue every operation as its own job, all sharing `metadata.root_job_id
    /// = batchId` so the Worker Pool and Progress Monitor can recognize batch
    /// membership. Fails immediately on an empty operation list; on a partial
    /// enqueue failure the batch is still recorded with whatever got through.
    pub async fn enqueue_batch(
        &self,
        operations: Vec<BatchOperation>,
        source: impl Into<String>,
        metadata: JobContext,
        options: BatchOptions,
    ) -> Result<String, QueueError> {
        if operations.is_empty() {
            return Err(QueueError::BatchEmpty);
        }

        let source = source.into();
        let batch_id = format!("batch_{}", Uuid::new_v4());
        let started_at = now_ms();

        let mut member_metadata = metadata.clone();
        member_metadata.root_job_id = Some(batch_id.clone());

        let mut job_ids = Vec::with_capacity(operations.len());
        let mut enqueue_error = None;

        for op in &operations {
            let job_options = EnqueueOptions::new(source.clone(), member_metadata.clone())
                .with_priority(options.priority)
                .with_max_retries(options.max_retries);

            match self.queue.enqueue(op.job_type.clone(), op.data.clone(), job_options).await {
                Ok(id) => job_ids.push(id),
                Err(e) => {
                    enqueue_error = Some(e);
                    break;
                }
            }
        }

        self.batches.insert(
            batch_id.clone(),
            Batch {
                id: batch_id.clone(),
                job_ids,
                operations,
                source,
                metadata,
                started_at,
            },
        );

        if let Some(err) = enqueue_error {
            return Err(err);
        }
        Ok(batch_id)
    }

    pub async fn get_batch_status(&self, batch_id: &str) -> Result<Option<BatchStatusReport>, QueueError> {
        let Some(batch) = self.batches.get(batch_id).map(|b| b.clone()) else {
            return Ok(None);
        };
        self.aggregate(&batch).await.map(Some)
    }

    async fn aggregate(&self, batch: &Batch) -> Result<BatchStatusReport, QueueError> {
        let mut completed = 0;
        let mut failed = 0;
        let mut pending = 0;
        let mut processing = 0;
        let mut errors = Vec::new();
        let mut current_operation = None;

        for (idx, job_id) in batch.job_ids.iter().enumerate() {
            let Some(job) = self.queue.get_status(job_id).await? else {
                continue;
            };
            match job.status {
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => {
                    failed += 1;
                    if let Some(err) = job.last_error {
                        errors.push(err);
                    }
                }
                JobStatus::Pending => {
                    pending += 1;
                    if current_operation.is_none() {
                        current_operation = batch.operations.get(idx).map(|op| format!("Processing {}", op.job_type));
                    }
                }
                JobStatus::Processing => {
                    processing += 1;
                    if current_operation.is_none() {
                        current_operation = batch.operations.get(idx).map(|op| format!("Processing {}", op.job_type));
                    }
                }
            }
        }

        let status = if pending > 0 || processing > 0 {
            BatchStatus::Processing
        } else if failed > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };

        Ok(BatchStatusReport {
            total_operations: batch.operations.len(),
            completed_operations: completed,
            failed_operations: failed,
            pending_operations: pending,
            processing_operations: processing,
            status,
            errors,
            current_operation,
        })
    }

    /// All batches whose aggregate status is non-terminal, paired with their
    /// metadata.
    pub async fn get_active_batches(&self) -> Result<Vec<(Batch, BatchStatusReport)>, QueueError> {
        let snapshot: Vec<Batch> = self.batches.iter().map(|e| e.value().clone()).collect();
        let mut active = Vec::new();
        for batch in snapshot {
            let report = self.aggregate(&batch).await?;
            if report.status == BatchStatus::Processing {
                active.push((batch, report));
            }
        }
        Ok(active)
    }

    /// Drop batches older than `older_than_ms` whose aggregate status is
    /// terminal. Returns the number removed.
    pub async fn cleanup(&self, older_than_ms: i64) -> Result<usize, QueueError> {
        let cutoff = now_ms() - older_than_ms;
        let snapshot: Vec<Batch> = self.batches.iter().map(|e| e.value().clone()).collect();

        let mut removed = 0;
        for batch in snapshot {
            if batch.started_at >= cutoff {
                continue;
            }
            let report = self.aggregate(&batch).await?;
            if report.status != BatchStatus::Processing {
                self.batches.remove(&batch.id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl crate::traits::Service for BatchManager {
    async fn health_check(&self) -> crate::Result<()> {
        self.queue.get_stats().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::auto_migrate;
    use crate::jobs::job::OperationType;
    use crate::jobs::registry::HandlerRegistry;
    use crate::jobs::store::JobStore;
    use crate::jobs::{JobHandler, ProgressReporter};
    use crate::Result;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

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

    async fn manager() -> BatchManager {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        auto_migrate(&pool).await.unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("embed", Arc::new(EchoHandler), None);
        let queue = QueueService::new(JobStore::new(pool), registry);
        BatchManager::new(queue)
    }

    #[tokio::test]
    async fn health_check_succeeds_against_a_live_queue() {
        use crate::traits::Service;
        let mgr = manager().await;
        assert!(mgr.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn empty_batch_fails() {
        let mgr = manager().await;
        let err = mgr
            .enqueue_batch(vec![], "test", JobContext::new(OperationType::BatchProcessing), BatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::BatchEmpty));
    }

    #[tokio::test]
    async fn batch_status_aggregates_before_and_after_completion() {
        let mgr = manager().await;
        let ops = vec![
            BatchOperation::new("embed", serde_json::json!({"n": 1})),
            BatchOperation::new("embed", serde_json::json!({"n": 2})),
            BatchOperation::new("embed", serde_json::json!({"n": 3})),
        ];
        let batch_id = mgr
            .enqueue_batch(ops, "test", JobContext::new(OperationType::BatchProcessing), BatchOptions::default())
            .await
            .unwrap();

        let status = mgr.get_batch_status(&batch_id).await.unwrap().unwrap();
        assert_eq!(status.total_operations, 3);
        assert_eq!(status.completed_operations, 0);
        assert_eq!(status.status, BatchStatus::Processing);
        assert_eq!(mgr.get_active_batches().await.unwrap().len(), 1);

        let batch = mgr.batches.get(&batch_id).unwrap().clone();
        for job_id in &batch.job_ids {
            mgr.queue.dequeue().await.unwrap();
            mgr.queue.complete(job_id, serde_json::json!({})).await.unwrap();
        }

        let status = mgr.get_batch_status(&batch_id).await.unwrap().unwrap();
        assert_eq!(status.completed_operations, 3);
        assert_eq!(status.status, BatchStatus::Completed);
        assert!(mgr.get_active_batches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn member_jobs_share_root_job_id_equal_to_batch_id() {
        let mgr = manager().await;
        let ops = vec![BatchOperation::new("embed", serde_json::json!({}))];
        let batch_id = mgr
            .enqueue_batch(ops, "test", JobContext::new(OperationType::BatchProcessing), BatchOptions::default())
            .await
            .unwrap();

        let batch = mgr.batches.get(&batch_id).unwrap().clone();
        let job = mgr.queue.get_status(&batch.job_ids[0]).await.unwrap().unwrap();
        assert_eq!(job.metadata.root_job_id.as_deref(), Some(batch_id.as_str()));
        assert_ne!(job.metadata.root_job_id.as_deref(), Some(job.id.as_str()));
    }
}
