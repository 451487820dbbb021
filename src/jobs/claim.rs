//! Worker side of the job queue.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ActiveState, ClaimedJob, JobDescriptor, JobPaths};
use crate::config::JobsConfig;
use crate::coord::{
    Coordination, CreateMode, DistributedLock, SharedCoordination, WatchedEvent, Watcher,
};
use crate::error::{CoordError, Result, SharddistError};

/// Result of a single claim scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimedJob),
    /// No pending job lists this host
    NoneEligible,
}

/// Claims jobs whose shard has a replica on this host.
///
/// Bound to one coordination session; rebuild it after the session expires.
pub struct JobClaimQueue {
    coord: SharedCoordination,
    paths: JobPaths,
    lock: DistributedLock,
    host: String,
    claim_wait: Duration,
    watcher: Watcher,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchedEvent>>,
}

impl JobClaimQueue {
    pub fn new(
        coord: SharedCoordination,
        paths: JobPaths,
        host: impl Into<String>,
        config: &JobsConfig,
    ) -> Self {
        let (watcher, events) = mpsc::unbounded_channel();
        let lock = DistributedLock::new(coord.clone(), paths.locks.clone(), config.lock_wait());
        Self {
            coord,
            paths,
            lock,
            host: host.into(),
            claim_wait: config.claim_wait(),
            watcher,
            events: tokio::sync::Mutex::new(events),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session_id(&self) -> u64 {
        self.coord.session_id()
    }

    /// Blocks until a job for this host is claimed.
    ///
    /// Wakes on changes to `new`, and re-scans after `claim_wait` in case a
    /// notification was missed.
    pub async fn take(&self) -> Result<ClaimedJob> {
        let never = CancellationToken::new();
        self.take_until(&never)
            .await?
            .ok_or_else(|| SharddistError::Internal("claim abandoned".to_string()))
    }

    /// Like [`JobClaimQueue::take`], but returns `None` once `shutdown` is
    /// cancelled.
    ///
    /// Cancellation is only honored between scans. A scan that removed a job
    /// from `new` always goes on to create its `active` node.
    pub async fn take_until(&self, shutdown: &CancellationToken) -> Result<Option<ClaimedJob>> {
        let mut events = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            events = self.events.lock() => events,
        };
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            // Anything already fired predates the scan below
            while events.try_recv().is_ok() {}

            match self.try_take().await? {
                ClaimOutcome::Claimed(job) => return Ok(Some(job)),
                ClaimOutcome::NoneEligible => {
                    tracing::trace!(host = %self.host, "No eligible job, waiting");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::timeout(self.claim_wait, events.recv()) => {}
                    }
                }
            }
        }
    }

    /// One locked scan of `new`, claiming the first eligible job.
    pub async fn try_take(&self) -> Result<ClaimOutcome> {
        let guard = self.lock.lock().await?;
        let scanned = self.scan().await;
        let unlocked = guard.unlock().await;
        let outcome = scanned?;
        unlocked?;
        Ok(outcome)
    }

    async fn scan(&self) -> Result<ClaimOutcome> {
        let children = self
            .coord
            .get_children(&self.paths.new, Some(&self.watcher))
            .await?;

        for id in children {
            let new_path = self.paths.new_job(&id);
            let data = match self.coord.get_data(&new_path, None).await {
                Ok((data, _)) => data,
                // Canceled by the manager
                Err(CoordError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let descriptor = match JobDescriptor::decode(&data) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Skipping undecodable job");
                    continue;
                }
            };
            if !descriptor.is_eligible(&self.host) {
                continue;
            }

            match self.coord.delete(&new_path, None).await {
                Ok(()) => {}
                Err(CoordError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            }
            let active_path = self.paths.active_job(&id);
            match self
                .coord
                .create(&active_path, ActiveState::Pending.payload(), CreateMode::Ephemeral)
                .await
            {
                Ok(_) => {}
                Err(CoordError::NodeExists(_)) => {
                    tracing::warn!(job_id = %id, "Job already active, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Job removed from new but not activated");
                    return Err(e.into());
                }
            }

            tracing::info!(job_id = %id, host = %self.host, input = %descriptor.input, "Job claimed");
            return Ok(ClaimOutcome::Claimed(ClaimedJob { id, descriptor }));
        }
        Ok(ClaimOutcome::NoneEligible)
    }

    /// Marks a claimed job done.
    pub async fn finish(&self, id: &str) -> Result<()> {
        self.set_state(id, ActiveState::Done).await
    }

    /// Marks a claimed job failed.
    pub async fn failed(&self, id: &str) -> Result<()> {
        self.set_state(id, ActiveState::Failed).await
    }

    async fn set_state(&self, id: &str, state: ActiveState) -> Result<()> {
        // Only the pending payload written at claim time is expected
        self.coord
            .set_data(&self.paths.active_job(id), state.payload(), Some(0))
            .await?;
        tracing::debug!(job_id = %id, state = %state, "Job state published");
        Ok(())
    }
}
