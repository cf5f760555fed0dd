pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod traits;

// Re-export commonly used types
pub use error::{Error, Result};
pub use config::{Config, DatabaseConfig, WorkerPoolConfig};
pub use db::create_pool;
pub use db::migrate::{auto_migrate, DbStatus, Migrator};
pub use traits::Service;

pub use bus::{shared_local_bus, BusError, BusMessage, LocalMessageBus, MessageBus, Subscription};

pub use jobs::{
    Batch, BatchDetails, BatchManager, BatchOperation, BatchOptions, BatchStatus,
    BatchStatusReport, Deduplication, EnqueueOptions, HandlerRegistry, Job, JobContext,
    JobDetails, JobHandler, JobProgressEvent, JobStatus, OperationType, ProgressDetails,
    ProgressEventType, ProgressMonitor, ProgressReporter, ProgressUpdate, QueueError,
    QueueService, QueueStats, WorkerPool, WorkerStats, PROGRESS_CHANNEL,
};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
