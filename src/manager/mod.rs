//! Manager: runs one batch of scans over a set of shards.
//!
//! # Batch Flow
//!
//! 1. Open a coordination session and make sure the job tree exists
//! 2. Spawn the watch dispatcher and start the [`ResultCombiner`]
//! 3. Submit one job per shard; submission blocks while `max_jobs` are in flight
//! 4. Close the queue and wait for every job to finish, up to the job timeout
//! 5. On timeout cancel what is still unclaimed and stop the combiner
//! 6. Give the combiner up to the job timeout to drain, then stop it too
//!
//! Batches with a single shard, or that need no files, never touch the
//! coordination tree and run through [`direct`] instead.

pub mod combiner;
pub mod direct;

pub use combiner::{CombineOutcome, CombinerHandle, CombinerReport, ResultCombiner};
pub use direct::DirectReport;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::coord::{Connector, Retrying, SharedCoordination};
use crate::error::Result;
use crate::jobs::{JobDescriptor, JobPaths, JobSubmissionQueue, Submission};
use crate::storage::SharedStorage;

/// Grace period for the combiner after it was told to stop.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// One input shard and the hosts holding a replica of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub path: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Reads a JSON array of [`ShardSpec`]s.
pub async fn load_manifest(path: &Path) -> Result<Vec<ShardSpec>> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    /// Arguments passed through to the scan and merge programs
    pub args: Vec<String>,
    pub filter: String,
    pub shards: Vec<ShardSpec>,
    /// Run the program once without input, ignoring `shards`
    pub no_files: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Distributed,
    Direct,
    Passthrough,
}

impl BatchMode {
    pub fn for_request(request: &BatchRequest) -> Self {
        if request.no_files {
            BatchMode::Passthrough
        } else if request.shards.len() == 1 {
            BatchMode::Direct
        } else {
            BatchMode::Distributed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub mode: BatchMode,
    pub submitted: usize,
    pub completed: usize,
    pub canceled: usize,
    pub timed_out: bool,
    /// Set for distributed batches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combine: Option<CombinerReport>,
    /// Set for direct and passthrough batches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<DirectReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    fn new(mode: BatchMode) -> Self {
        let now = Utc::now();
        Self {
            batch_id: Uuid::new_v4(),
            mode,
            submitted: 0,
            completed: 0,
            canceled: 0,
            timed_out: false,
            combine: None,
            local: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// True if the batch finished in time and its final program exited 0.
    pub fn succeeded(&self) -> bool {
        if self.timed_out {
            return false;
        }
        match (&self.combine, &self.local) {
            (Some(combine), _) => combine.exit_code == Some(0),
            (None, Some(local)) => local.succeeded(),
            (None, None) => true,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct Manager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
}

impl Manager {
    pub fn new(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Runs one batch, writing merged output to `stdout`.
    ///
    /// Cancelling `shutdown` behaves like a timeout: unclaimed jobs are
    /// removed and the combiner is stopped.
    pub async fn run<O, E>(
        &self,
        request: BatchRequest,
        stdout: O,
        stderr: E,
        shutdown: CancellationToken,
    ) -> Result<BatchReport>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let mode = BatchMode::for_request(&request);
        let mut report = BatchReport::new(mode);
        tracing::info!(
            batch_id = %report.batch_id,
            mode = ?mode,
            shards = request.shards.len(),
            "Starting batch"
        );

        match mode {
            BatchMode::Passthrough => {
                let local = direct::run_passthrough(
                    &self.config.direct,
                    &request.args,
                    &request.filter,
                    self.config.jobs.job_timeout(),
                    stdout,
                    stderr,
                )
                .await?;
                report.timed_out = local.timed_out;
                report.local = Some(local);
            }
            BatchMode::Direct => {
                let shard = Path::new(&request.shards[0].path);
                report.submitted = 1;
                let local = direct::run_direct(
                    &self.config.direct,
                    shard,
                    &request.args,
                    &request.filter,
                    self.config.jobs.job_timeout(),
                    stdout,
                    stderr,
                )
                .await?;
                report.timed_out = local.timed_out;
                if !local.timed_out {
                    report.completed = 1;
                }
                report.local = Some(local);
            }
            BatchMode::Distributed => {
                self.run_distributed(&request, stdout, stderr, shutdown, &mut report)
                    .await?;
            }
        }

        report.finished_at = Utc::now();
        tracing::info!(
            batch_id = %report.batch_id,
            submitted = report.submitted,
            completed = report.completed,
            canceled = report.canceled,
            timed_out = report.timed_out,
            "Batch finished"
        );
        Ok(report)
    }

    async fn run_distributed<O, E>(
        &self,
        request: &BatchRequest,
        stdout: O,
        stderr: E,
        shutdown: CancellationToken,
        report: &mut BatchReport,
    ) -> Result<()>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let session = self.connector.connect().await?;
        let coord: SharedCoordination =
            Arc::new(Retrying::new(session, self.config.coord.retry_backoff()));
        let paths = JobPaths::new(&self.config.coord.root, &self.config.jobs.jobs_dir);
        paths.ensure(&coord).await?;

        let storage = SharedStorage::new(self.config.storage.shared_tmp.clone());
        storage.ensure().await?;

        let (queue, events) = JobSubmissionQueue::new(coord, paths, &self.config.jobs);
        let watch_stop = CancellationToken::new();
        let dispatcher = tokio::spawn(queue.clone().dispatch_watches(events, watch_stop.clone()));

        let mut combiner = ResultCombiner::new(self.config.merge.clone(), storage, queue.clone())
            .start(&request.args, &request.filter, stdout, stderr)?;

        let submitted = self.submit_all(&queue, request, &shutdown).await;
        queue.close();
        let submit_error = match submitted {
            Ok(n) => {
                report.submitted = n;
                None
            }
            Err(e) => Some(e),
        };

        let finished = if submit_error.is_some() {
            false
        } else {
            tokio::select! {
                done = queue.await_done(self.config.jobs.job_timeout()) => done,
                _ = shutdown.cancelled() => false,
            }
        };

        let combined = if finished {
            let waited =
                tokio::time::timeout(self.config.jobs.job_timeout(), combiner.wait()).await;
            match waited {
                Ok(combined) => Some(combined),
                Err(_) => {
                    report.timed_out = true;
                    tracing::error!(
                        batch_id = %report.batch_id,
                        timeout_secs = self.config.jobs.job_timeout().as_secs(),
                        "Timed out waiting for the combiner to finish"
                    );
                    stop_combiner(&mut combiner).await
                }
            }
        } else {
            report.timed_out = submit_error.is_none() && !shutdown.is_cancelled();
            if report.timed_out {
                tracing::error!(
                    batch_id = %report.batch_id,
                    active = queue.active_count(),
                    timeout_secs = self.config.jobs.job_timeout().as_secs(),
                    "Batch timed out"
                );
            }
            if let Err(e) = queue.cancel_all().await {
                tracing::warn!(error = %e, "Failed to cancel remaining jobs");
            }
            stop_combiner(&mut combiner).await
        };

        watch_stop.cancel();
        if let Err(e) = dispatcher.await {
            tracing::warn!(error = %e, "Watch dispatcher panicked");
        }

        report.completed = queue.completed_count();
        report.canceled = queue.canceled_count();
        if let Some(e) = submit_error {
            return Err(e);
        }
        report.combine = combined.transpose()?;
        Ok(())
    }

    /// Submits every shard, stopping early if the batch is canceled.
    async fn submit_all(
        &self,
        queue: &JobSubmissionQueue,
        request: &BatchRequest,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let mut submitted = 0;
        for shard in &request.shards {
            let descriptor = JobDescriptor::new(
                shard.path.clone(),
                shard.hosts.clone(),
                request.filter.clone(),
                request.args.clone(),
            );
            let created = tokio::select! {
                _ = shutdown.cancelled() => break,
                created = queue.create(&descriptor) => created?,
            };
            match created {
                Submission::Created(id) => {
                    tracing::debug!(job_id = %id, input = %shard.path, "Submitted job");
                    submitted += 1;
                }
                Submission::Canceled => {
                    tracing::info!(submitted, "Batch canceled, stopping submission");
                    break;
                }
            }
        }
        Ok(submitted)
    }
}

/// Stops the combiner and gives it [`STOP_GRACE`] to report.
async fn stop_combiner(combiner: &mut CombinerHandle) -> Option<Result<CombinerReport>> {
    combiner.stop();
    let waited = tokio::time::timeout(STOP_GRACE, combiner.wait()).await;
    match waited {
        Ok(combined) => Some(combined),
        Err(_) => {
            tracing::warn!("Combiner did not stop in time, abandoning it");
            None
        }
    }
}
