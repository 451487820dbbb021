//! Worker node: claims jobs for shards stored locally and runs them.
//!
//! # Execution Flow
//!
//! 1. The main loop acquires a concurrency permit, then claims a job through
//!    [`JobClaimQueue::take_until`], which stops waiting on shutdown but never
//!    abandons a claim halfway
//! 2. A job task runs [`ScanRunner::run`] while holding the permit
//! 3. On success the local output is moved to shared storage and the job is
//!    marked done, otherwise failed
//! 4. The permit is released when the task ends, whatever the outcome
//!
//! If the coordination session expires the loop opens a new one through its
//! [`Connector`] and rebuilds the claim queue.

pub mod runner;

pub use runner::{ScanResult, ScanRunner, ScanStatus};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::coord::{Connector, Coordination, Retrying, SharedCoordination};
use crate::error::{Result, SharddistError};
use crate::jobs::{ClaimedJob, JobClaimQueue, JobPaths};
use crate::storage::SharedStorage;

/// Pause after a failed claim or reconnect before trying again.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counters for the jobs this worker handled.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub claimed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub reconnects: AtomicU64,
}

impl WorkerStats {
    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

pub struct Worker {
    config: WorkerConfig,
    connector: Arc<dyn Connector>,
    runner: ScanRunner,
    storage: SharedStorage,
    permits: Arc<Semaphore>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(config: WorkerConfig, connector: Arc<dyn Connector>) -> Self {
        let runner = ScanRunner::new(
            config.scan.clone(),
            config.storage.local_tmp.clone(),
            config.jobs.job_timeout(),
        );
        let storage = SharedStorage::new(config.storage.shared_tmp.clone());
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            connector,
            runner,
            storage,
            permits,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Opens a fresh session and a claim queue bound to it.
    async fn open_queue(&self) -> Result<Arc<JobClaimQueue>> {
        let session = self.connector.connect().await?;
        let coord: SharedCoordination =
            Arc::new(Retrying::new(session, self.config.coord.retry_backoff()));
        let paths = JobPaths::new(&self.config.coord.root, &self.config.jobs.jobs_dir);
        paths.ensure(&coord).await?;
        tracing::info!(
            host = %self.config.host,
            session = coord.session_id(),
            "Worker connected"
        );
        Ok(Arc::new(JobClaimQueue::new(
            coord,
            paths,
            self.config.host.clone(),
            &self.config.jobs,
        )))
    }

    /// Runs until `shutdown` is cancelled, then waits for running jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.storage.ensure().await?;
        let mut queue = self.open_queue().await?;
        let mut jobs = JoinSet::new();
        tracing::info!(
            host = %self.config.host,
            concurrency = self.config.concurrency,
            "Worker started"
        );

        loop {
            while jobs.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|e| SharddistError::Internal(e.to_string()))?,
            };

            // Not raced against shutdown: a claim in progress must complete
            match queue.take_until(&shutdown).await {
                Ok(None) => break,
                Ok(Some(job)) => {
                    self.stats.claimed.fetch_add(1, Ordering::Relaxed);
                    jobs.spawn(run_job(
                        queue.clone(),
                        self.runner.clone(),
                        self.storage.clone(),
                        self.stats.clone(),
                        job,
                        permit,
                    ));
                }
                Err(e) if e.is_session_expired() => {
                    drop(permit);
                    tracing::warn!(host = %self.config.host, error = %e, "Session expired, reconnecting");
                    queue = match self.reconnect(&shutdown).await {
                        Some(queue) => queue,
                        None => break,
                    };
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(host = %self.config.host, error = %e, "Claim failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }

        tracing::info!(running = jobs.len(), "Worker shutting down, draining jobs");
        while jobs.join_next().await.is_some() {}
        Ok(())
    }

    /// Retries opening a queue until it succeeds or shutdown is requested.
    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<Arc<JobClaimQueue>> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
            match self.open_queue().await {
                Ok(queue) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    return Some(queue);
                }
                Err(e) => tracing::warn!(error = %e, "Reconnect failed"),
            }
        }
    }
}

/// Runs one claimed job. The permit is released when this returns.
async fn run_job(
    queue: Arc<JobClaimQueue>,
    runner: ScanRunner,
    storage: SharedStorage,
    stats: Arc<WorkerStats>,
    job: ClaimedJob,
    _permit: OwnedSemaphorePermit,
) {
    let result = runner.run(&job).await;

    let succeeded = result.succeeded()
        && match storage.move_from_local(&result.output, &job.id).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(job_id = %job.id, "Scan produced no output");
                true
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to move output to shared storage");
                false
            }
        };

    let published = if succeeded {
        stats.succeeded.fetch_add(1, Ordering::Relaxed);
        queue.finish(&job.id).await
    } else {
        stats.failed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = tokio::fs::remove_file(&result.output).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to remove local output");
            }
        }
        queue.failed(&job.id).await
    };
    if let Err(e) = published {
        tracing::error!(job_id = %job.id, error = %e, "Failed to publish job state");
    }
}
