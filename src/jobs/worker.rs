//! Worker Pool (§4.3): concurrent dispatcher consuming from `QueueService`.
//!
//! The dispatch loop follows the reference `JobQueueService::run_worker`
//! tick-driven shape (`tokio::select!` over a poll interval plus a shutdown
//! signal), generalized so each tick's dequeues fan out into true concurrent
//! `tokio::spawn` tasks up to `concurrency`, joined on `stop` rather than
//! fire-and-forgotten.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use dashmap::DashSet;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use super::job::{Job, JobStatus};
use super::progress::ProgressMonitor;
use super::queue::QueueService;
use super::registry::HandlerRegistry;
use crate::config::WorkerPoolConfig;

/// Runtime counters exposed alongside the pool (§4.3 "Statistics").
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed_jobs: u64,
    pub failed_jobs: u64,
    pub active_jobs: usize,
    pub uptime_ms: i64,
    pub is_running: bool,
    pub last_error: Option<String>,
}

/// Concurrent dispatcher: polls `QueueService::dequeue` on a tick, fans
/// dequeued jobs out to `concurrency` concurrent executions, and drains
/// in-flight work on `stop` (§4.3, §5).
pub struct WorkerPool {
    queue: QueueService,
    registry: Arc<HandlerRegistry>,
    monitor: Arc<ProgressMonitor>,
    config: WorkerPoolConfig,

    running: Arc<AtomicBool>,
    in_flight: Arc<DashSet<String>>,
    handles: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
    dispatcher: AsyncMutex<Option<JoinHandle<()>>>,

    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    last_error: Arc<StdMutex<Option<String>>>,
    started_at: StdMutex<Option<Instant>>,
}

impl WorkerPool {
    pub fn new(
        queue: QueueService,
        registry: Arc<HandlerRegistry>,
        monitor: Arc<ProgressMonitor>,
        config: WorkerPoolConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            queue,
            registry,
            monitor,
            config,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(DashSet::new()),
            handles: Arc::new(AsyncMutex::new(Vec::new())),
            dispatcher: AsyncMutex::new(None),
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(StdMutex::new(None)),
            started_at: StdMutex::new(None),
        });

        if pool.config.auto_start {
            let started = pool.clone();
            tokio::spawn(async move { started.start().await });
        }

        pool
    }

    /// Begin polling. A second call while already running is a no-op (§4.3).
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock().unwrap() = Some(Instant::now());

        let pool = self.clone();
        let handle = tokio::spawn(async move { pool.dispatch_loop().await });
        *self.dispatcher.lock().await = Some(handle);
        info!(concurrency = self.config.concurrency, "worker pool started");
    }

    /// Stop accepting new jobs, wait for all in-flight jobs to finish, then
    /// mark the pool stopped (§4.3 graceful shutdown).
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }

        loop {
            let next = {
                let mut handles = self.handles.lock().await;
                handles.pop()
            };
            match next {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }

        info!("worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed_jobs: self.processed.load(Ordering::SeqCst),
            failed_jobs: self.failed.load(Ordering::SeqCst),
            active_jobs: self.in_flight.len(),
            uptime_ms: self
                .started_at
                .lock()
                .unwrap()
                .map(|t| t.elapsed().as_millis() as i64)
                .unwrap_or(0),
            is_running: self.is_running(),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }

    /// The tick-driven poll loop (§4.3 "Dispatch loop"): each tick computes
    /// `available = concurrency - in_flight`, stops once `max_jobs` is hit,
    /// and claims up to `available` jobs via `dequeue`.
    async fn dispatch_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.prune_finished().await;

            let available = self.config.concurrency.saturating_sub(self.in_flight.len());
            if available == 0 {
                continue;
            }

            if self.config.max_jobs > 0 && self.processed.load(Ordering::SeqCst) >= self.config.max_jobs {
                debug!("max_jobs reached, stopping dispatch loop");
                self.running.store(false, Ordering::SeqCst);
                break;
            }

            for _ in 0..available {
                match self.queue.dequeue().await {
                    Ok(Some(job)) => self.dispatch(job).await,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "dequeue failed");
                        *self.last_error.lock().unwrap() = Some(e.to_string());
                        break;
                    }
                }
            }
        }
    }

    async fn prune_finished(&self) {
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
    }

    async fn dispatch(self: &Arc<Self>, job: Job) {
        self.in_flight.insert(job.id.clone());
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let job_id = job.id.clone();
            pool.execute(job).await;
            pool.in_flight.remove(&job_id);
            pool.processed.fetch_add(1, Ordering::SeqCst);
        });
        self.handles.lock().await.push(handle);
    }

    /// Per-job execution (§4.3 "Per-job execution"): resolve handler,
    /// validate, process, persist outcome, and notify the Progress Monitor
    /// on a terminal transition.
    async fn execute(&self, job: Job) {
        let handler = match self.registry.get_handler(&job.job_type) {
            Some(handler) => handler,
            None => {
                warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
                self.record_dispatch_failure(&job, "no handler").await;
                return;
            }
        };

        let Some(parsed) = handler.validate_and_parse(&job.data) else {
            warn!(job_id = %job.id, "handler rejected job data");
            self.record_dispatch_failure(&job, "invalid data").await;
            return;
        };

        let reporter = self.monitor.create_reporter(job.id.clone());

        match handler.process(&parsed, &job.id, &reporter).await {
            Ok(result) => {
                if let Err(e) = self.queue.complete(&job.id, result).await {
                    error!(job_id = %job.id, error = %e, "failed to persist job completion");
                    return;
                }
                if let Ok(Some(completed)) = self.queue.get_status(&job.id).await {
                    if let Err(e) = self.monitor.handle_job_status_change(&completed).await {
                        warn!(job_id = %job.id, error = %e, "failed to broadcast completion event");
                    }
                }
            }
            Err(e) => {
                handler.on_error(&e, &parsed, &job.id, &reporter).await;

                match self.queue.fail(&job.id, &e.to_string()).await {
                    Ok(JobStatus::Failed) => {
                        self.failed.fetch_add(1, Ordering::SeqCst);
                        *self.last_error.lock().unwrap() = Some(e.to_string());
                        if let Ok(Some(failed)) = self.queue.get_status(&job.id).await {
                            if let Err(e) = self.monitor.handle_job_status_change(&failed).await {
                                warn!(job_id = %job.id, error = %e, "failed to broadcast failure event");
                            }
                        }
                    }
                    Ok(_) => {
                        // Retry scheduled; not a terminal transition, no event (§4.5).
                    }
                    Err(store_err) => {
                        error!(job_id = %job.id, error = %store_err, "failed to record job failure");
                    }
                }
            }
        }
    }

    /// Shared path for the two dispatch-time rejections (§4.3 steps 1-2): no
    /// handler registered, or the handler rejected the payload. Both are
    /// non-recoverable per §7 ("job fails immediately"), so this goes through
    /// `fail_terminal` rather than the retrying `fail` path — no backoff, no
    /// further dispatch attempts.
    async fn record_dispatch_failure(&self, job: &Job, reason: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = Some(reason.to_string());

        if let Err(e) = self.queue.fail_terminal(&job.id, reason).await {
            error!(job_id = %job.id, error = %e, "failed to record dispatch failure");
            return;
        }
        if let Ok(Some(failed)) = self.queue.get_status(&job.id).await {
            if let Err(e) = self.monitor.handle_job_status_change(&failed).await {
                warn!(job_id = %job.id, error = %e, "failed to broadcast failure event");
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::traits::Service for WorkerPool {
    /// Healthy iff the pool is running and its last dispatch attempt did not
    /// error. A pool that has never been started reports healthy (nothing has
    /// failed yet).
    async fn health_check(&self) -> crate::Result<()> {
        if !self.is_running() && self.started_at.lock().unwrap().is_some() {
            return Err(crate::Error::Other("worker pool is stopped".to_string()));
        }
        Ok(())
    }
}
