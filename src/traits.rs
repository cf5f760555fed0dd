use async_trait::async_trait;

use crate::Result;

/// Service pattern trait implemented by the crate's long-lived components
/// (`QueueService`, `WorkerPool`, `BatchManager`) so callers embedding this
/// crate can wire a uniform health check into their own readiness probes.
#[async_trait]
pub trait Service: Send + Sync {
    /// Health check for the service
    async fn health_check(&self) -> Result<()>;
}
