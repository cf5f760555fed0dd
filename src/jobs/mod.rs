//! Durable, prioritized, retry-capable job queue (§1–§4).
//!
//! `job` holds the data model, `registry` the in-process handler map,
//! `store` the SQL persistence layer, `queue` the public enqueue/dequeue
//! facade, `worker` the dispatch loop, `batch` batch-grouping, and `progress`
//! the event-bus reporter. Everything fans out from `QueueService`.

pub mod batch;
pub mod job;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod store;
pub mod worker;

mod queue;

pub use batch::{Batch, BatchManager, BatchOperation, BatchOptions, BatchStatus, BatchStatusReport};
pub use job::{Deduplication, Job, JobContext, JobStatus, OperationType};
pub use progress::{
    BatchDetails, JobDetails, JobProgressEvent, ProgressDetails, ProgressEventType, ProgressMonitor,
    ProgressReporter, ProgressUpdate, PROGRESS_CHANNEL,
};
pub use queue::{EnqueueOptions, QueueService, QueueStats};
pub use registry::HandlerRegistry;
pub use worker::{WorkerPool, WorkerStats};

use async_trait::async_trait;
use std::fmt;

use crate::{Error, Result};

/// Errors raised by the queue layer (§7).
#[derive(Debug)]
pub enum QueueError {
    /// No handler registered for a job's type.
    NoHandler(String),

    /// A handler rejected the job's `data` payload before execution.
    InvalidJobData(String),

    /// A handler ran and returned an error.
    HandlerFailure(String),

    /// An enqueue request was replaced/coalesced into an existing job, not an
    /// error condition per se but surfaced through the same channel some
    /// callers match on (§4.2 dedup modes).
    Replaced(String),

    /// A persistence-layer failure reaching the store.
    StorageError(String),

    /// `enqueueBatch` called with zero jobs.
    BatchEmpty,

    /// Lookup by id/entity id found nothing.
    NotFound(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::NoHandler(t) => write!(f, "no handler registered for job type '{}'", t),
            QueueError::InvalidJobData(msg) => write!(f, "invalid job data: {}", msg),
            QueueError::HandlerFailure(msg) => write!(f, "handler failed: {}", msg),
            QueueError::Replaced(id) => write!(f, "job {} was replaced by a newer enqueue", id),
            QueueError::StorageError(msg) => write!(f, "storage error: {}", msg),
            QueueError::BatchEmpty => write!(f, "batch must contain at least one job"),
            QueueError::NotFound(id) => write!(f, "job {} not found", id),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        QueueError::StorageError(error.to_string())
    }
}

/// Implemented by callers for every job `type` they want the worker pool to
/// execute (§4.1 Handler Registry, §6.3). A handler is a capability set of
/// three operations; only `process` is required.
///
/// Handlers are responsible for their own internal timeouts; the worker pool
/// does not impose one (§5, §9 Open Questions).
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Validate and parse a raw payload, pure and deterministic. Returning
    /// `None` rejects the payload: `enqueue` fails with `InvalidJobData`
    /// before the job is persisted, and a dispatch-time re-check failing the
    /// same way fails the job outright with no retry (§4.2, §4.3 step 2).
    /// The default accepts any payload unchanged.
    fn validate_and_parse(&self, raw: &serde_json::Value) -> Option<serde_json::Value> {
        Some(raw.clone())
    }

    /// Run the job against its parsed payload, returning the JSON value to
    /// store as `Job::result`. May call `reporter.report(..)` any number of
    /// times to publish progress (§4.5).
    async fn process(
        &self,
        parsed: &serde_json::Value,
        job_id: &str,
        reporter: &ProgressReporter,
    ) -> Result<serde_json::Value>;

    /// Best-effort cleanup hook invoked when `process` returns an error.
    /// Its own failure is logged by the caller but never affects retry
    /// accounting (§4.1, §7).
    async fn on_error(
        &self,
        _error: &Error,
        _parsed: &serde_json::Value,
        _job_id: &str,
        _reporter: &ProgressReporter,
    ) {
    }
}
