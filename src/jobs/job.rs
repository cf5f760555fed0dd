//! Job, status, and routing metadata types (§3.1).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Job execution status. Transitions form a DAG:
/// `pending -> processing -> {completed | failed}`, and `processing ->
/// pending` when a retry is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse classification of what a job's operation is doing, carried in its
/// `JobContext` for subscriber routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    FileOperations,
    ContentOperations,
    DataProcessing,
    BatchProcessing,
}

impl Default for OperationType {
    fn default() -> Self {
        OperationType::DataProcessing
    }
}

/// Structured routing/telemetry context attached to every job (the
/// `JobContext` of the glossary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobContext {
    /// The plugin that owns this job's type, if any. Types registered by a
    /// plugin are conventionally prefixed `"{plugin_id}:"`.
    #[serde(default)]
    pub plugin_id: Option<String>,

    /// Equal to the job's own id for standalone jobs, or the owning batch's
    /// id for jobs enqueued through `enqueueBatch`. Left unset by producers;
    /// `QueueService::enqueue` fills it in at enqueue time and it is never
    /// mutated afterward.
    #[serde(default)]
    pub root_job_id: Option<String>,

    /// Opaque token a caller can use to correlate progress events with a
    /// client-side subscription (e.g. a chat turn or CLI invocation).
    #[serde(default)]
    pub progress_token: Option<String>,

    #[serde(default)]
    pub operation_type: OperationType,

    #[serde(default)]
    pub operation_target: Option<String>,
}

impl JobContext {
    pub fn new(operation_type: OperationType) -> Self {
        Self {
            operation_type,
            ..Default::default()
        }
    }

    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn with_operation_target(mut self, target: impl Into<String>) -> Self {
        self.operation_target = Some(target.into());
        self
    }

    pub fn with_progress_token(mut self, token: impl Into<String>) -> Self {
        self.progress_token = Some(token.into());
        self
    }
}

/// Deduplication policy applied at enqueue time (§4.2). Scope is
/// `(type, deduplication_key)` among currently active (pending/processing)
/// jobs; an absent key matches other absent keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Deduplication {
    #[default]
    None,
    Skip,
    Replace,
    Coalesce,
}

/// A durable unit of work (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub data: serde_json::Value,
    pub status: JobStatus,
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub source: Option<String>,
    pub metadata: JobContext,
    pub deduplication_key: Option<String>,
    pub created_at: i64,
    pub scheduled_for: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Job {
    /// A job is eligible to run iff `status = pending` and `scheduled_for <= now`.
    pub fn is_eligible(&self, now_ms: i64) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now_ms
    }

    /// Whether this job is a standalone job (its own root) or a batch member.
    pub fn is_batch_member(&self) -> bool {
        self.metadata
            .root_job_id
            .as_deref()
            .is_some_and(|root| root != self.id)
    }
}
