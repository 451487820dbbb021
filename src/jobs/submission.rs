//! Manager side of the job queue.
//!
//! Jobs are created under `new`, tracked in an in-process registry until
//! their `active` node reaches a terminal state, and then handed to the
//! combiner through a bounded FIFO in completion order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ActiveState, JobDescriptor, JobPaths};
use crate::config::JobsConfig;
use crate::coord::{
    node_name, Coordination, CreateMode, DistributedLock, EventKind, SharedCoordination,
    WatchedEvent, Watcher,
};
use crate::error::{CoordError, Result};

/// Outcome of [`JobSubmissionQueue::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Created(String),
    /// The batch was canceled before the job could be submitted
    Canceled,
}

#[derive(Debug, Default)]
struct State {
    /// Registered jobs and when they were submitted
    active: HashMap<String, Instant>,
    /// Registered jobs plus admission slots reserved by in-flight `create`s
    active_count: usize,
    /// Ids sent to the completed FIFO and not yet taken
    queued: usize,
    completed_total: usize,
    canceled_total: usize,
    closed: bool,
    canceled: bool,
}

struct Inner {
    coord: SharedCoordination,
    paths: JobPaths,
    lock: DistributedLock,
    max_jobs: usize,
    admission_poll: Duration,
    state: Mutex<State>,
    changed: Notify,
    completed_tx: mpsc::Sender<String>,
    completed_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    /// Serializes `cancel_all` so this session holds at most one lock attempt
    cancel_gate: tokio::sync::Mutex<()>,
    watcher: Watcher,
}

/// Creates jobs, enforces the in-flight limit and collects completions.
///
/// Cloning is cheap; all clones share one queue.
#[derive(Clone)]
pub struct JobSubmissionQueue {
    inner: Arc<Inner>,
}

impl JobSubmissionQueue {
    /// Returns the queue and the receiver of its watch events, which must be
    /// driven by [`JobSubmissionQueue::dispatch_watches`].
    pub fn new(
        coord: SharedCoordination,
        paths: JobPaths,
        config: &JobsConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WatchedEvent>) {
        let max_jobs = config.max_jobs.max(1);
        let (completed_tx, completed_rx) = mpsc::channel(max_jobs);
        let (watcher, events) = mpsc::unbounded_channel();
        let lock = DistributedLock::new(coord.clone(), paths.locks.clone(), config.lock_wait());
        let queue = Self {
            inner: Arc::new(Inner {
                coord,
                paths,
                lock,
                max_jobs,
                admission_poll: config.admission_poll(),
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                completed_tx,
                completed_rx: tokio::sync::Mutex::new(completed_rx),
                cancel_gate: tokio::sync::Mutex::new(()),
                watcher,
            }),
        };
        (queue, events)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits one job, blocking while `max_jobs` jobs are in flight.
    pub async fn create(&self, descriptor: &JobDescriptor) -> Result<Submission> {
        let payload = descriptor.encode()?;
        if !self.reserve_slot().await {
            return Ok(Submission::Canceled);
        }

        let created = self
            .inner
            .coord
            .create(
                &format!("{}/", self.inner.paths.new),
                &payload,
                CreateMode::EphemeralSequential,
            )
            .await;
        let created = match created {
            Ok(path) => path,
            Err(e) => {
                self.release_slot();
                return Err(e.into());
            }
        };
        let id = node_name(&created).to_string();

        let canceled = {
            let mut st = self.state();
            st.active.insert(id.clone(), Instant::now());
            st.canceled
        };
        if canceled {
            // cancel_all ran between the reservation and the registration
            match self.inner.coord.delete(&created, None).await {
                Ok(()) => {
                    self.deregister(&id, false);
                    return Ok(Submission::Canceled);
                }
                // Claimed in the meantime: let it run like any other claimed job
                Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(job_id = %id, input = %descriptor.input, "Job created");

        // A fast worker may already have claimed the job, or even finished it
        let active = self.inner.paths.active_job(&id);
        if self
            .inner
            .coord
            .exists(&active, Some(&self.inner.watcher))
            .await?
            .is_some()
        {
            self.complete_if_finished(&id).await?;
        }
        Ok(Submission::Created(id))
    }

    /// Waits for a free admission slot and reserves it. Returns false if the
    /// queue was canceled meanwhile.
    async fn reserve_slot(&self) -> bool {
        loop {
            {
                let mut st = self.state();
                if st.canceled {
                    return false;
                }
                if st.active_count < self.inner.max_jobs {
                    st.active_count += 1;
                    return true;
                }
            }
            tokio::time::sleep(self.inner.admission_poll).await;
        }
    }

    fn release_slot(&self) {
        {
            let mut st = self.state();
            st.active_count = st.active_count.saturating_sub(1);
        }
        self.inner.changed.notify_waiters();
    }

    /// Removes a job from the registry. Returns false if it was not
    /// registered, which makes every completion take effect exactly once.
    fn deregister(&self, id: &str, completed: bool) -> bool {
        let removed = {
            let mut st = self.state();
            match st.active.remove(id) {
                Some(submitted) => {
                    st.active_count = st.active_count.saturating_sub(1);
                    if completed {
                        st.queued += 1;
                        st.completed_total += 1;
                    } else {
                        st.canceled_total += 1;
                    }
                    tracing::trace!(job_id = %id, elapsed_ms = submitted.elapsed().as_millis() as u64, "Job deregistered");
                    true
                }
                None => false,
            }
        };
        if removed && !completed {
            self.inner.changed.notify_waiters();
        }
        removed
    }

    fn is_registered(&self, id: &str) -> bool {
        self.state().active.contains_key(id)
    }

    /// Re-arms the data watch on the job's `active` node and, if the job
    /// reached a terminal state, removes it and queues its id for combining.
    ///
    /// Returns true if this call completed the job.
    pub async fn complete_if_finished(&self, id: &str) -> Result<bool> {
        let path = self.inner.paths.active_job(id);
        let data = match self
            .inner
            .coord
            .get_data(&path, Some(&self.inner.watcher))
            .await
        {
            Ok((data, _)) => data,
            Err(CoordError::NoNode(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let state = match ActiveState::from_payload(&data) {
            Some(state) if state.is_terminal() => state,
            Some(_) => return Ok(false),
            None => {
                tracing::warn!(job_id = %id, "Unknown job state payload");
                return Ok(false);
            }
        };

        if !self.deregister(id, true) {
            return Ok(false);
        }
        match self.inner.coord.delete(&path, None).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Failed to remove finished job node");
            }
        }

        match state {
            ActiveState::Failed => tracing::warn!(job_id = %id, "Job failed"),
            _ => tracing::info!(job_id = %id, "Job done"),
        }
        if self.inner.completed_tx.send(id.to_string()).await.is_err() {
            tracing::error!(job_id = %id, "Completed queue closed");
        }
        self.inner.changed.notify_waiters();
        Ok(true)
    }

    /// Drives watch notifications until `shutdown` is cancelled.
    pub async fn dispatch_watches(
        self,
        mut events: mpsc::UnboundedReceiver<WatchedEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !event.path.starts_with(&self.inner.paths.active) {
                continue;
            }
            let id = node_name(&event.path).to_string();

            let result = match event.kind {
                EventKind::NodeDataChanged => self.complete_if_finished(&id).await,
                EventKind::NodeCreated if self.is_registered(&id) => {
                    self.complete_if_finished(&id).await
                }
                EventKind::NodeDeleted if self.is_registered(&id) => {
                    // The claiming worker lost its session; the batch will time out
                    tracing::warn!(job_id = %id, "Active job vanished before finishing");
                    Ok(false)
                }
                _ => Ok(false),
            };
            if let Err(e) = result {
                tracing::warn!(job_id = %id, error = %e, "Failed to process job watch");
            }
        }
    }

    /// Cancels every job not yet claimed by a worker.
    ///
    /// Runs under the distributed lock so no worker claims concurrently.
    /// Claimed jobs run to completion and still arrive through
    /// [`JobSubmissionQueue::take_completed`]. Calling it again is harmless,
    /// and concurrent calls run one after the other.
    pub async fn cancel_all(&self) -> Result<()> {
        let ids: Vec<String> = {
            let mut st = self.state();
            st.canceled = true;
            st.active.keys().cloned().collect()
        };
        self.inner.changed.notify_waiters();

        let _gate = self.inner.cancel_gate.lock().await;
        let guard = self.inner.lock.lock().await?;
        let mut canceled = 0usize;
        for id in ids {
            match self.inner.coord.delete(&self.inner.paths.new_job(&id), None).await {
                Ok(()) => {
                    if self.deregister(&id, false) {
                        canceled += 1;
                    }
                }
                // Already claimed
                Err(CoordError::NoNode(_)) => {}
                Err(e) => {
                    if let Err(unlock) = guard.unlock().await {
                        tracing::warn!(error = %unlock, "Failed to release lock after cancel error");
                    }
                    return Err(e.into());
                }
            }
        }
        guard.unlock().await?;
        tracing::info!(canceled, "Canceled unclaimed jobs");
        Ok(())
    }

    /// Marks the end of submissions for this batch.
    pub fn close(&self) {
        self.state().closed = true;
        self.inner.changed.notify_waiters();
    }

    /// Next completed job id in completion order.
    ///
    /// Returns `None` once the queue is closed or canceled and no job is
    /// active or waiting to be taken.
    pub async fn take_completed(&self) -> Option<String> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let st = self.state();
                if st.queued == 0 && st.active_count == 0 && (st.closed || st.canceled) {
                    return None;
                }
            }

            let mut rx = self.inner.completed_rx.lock().await;
            tokio::select! {
                id = rx.recv() => {
                    let id = id?;
                    {
                        let mut st = self.state();
                        st.queued = st.queued.saturating_sub(1);
                    }
                    self.inner.changed.notify_waiters();
                    return Some(id);
                }
                _ = notified => {}
            }
        }
    }

    /// True if nothing is in flight and nothing waits to be combined.
    pub fn all_done(&self) -> bool {
        let st = self.state();
        st.queued == 0 && st.active_count == 0
    }

    /// Waits until no job is in flight. Returns false on timeout.
    pub async fn await_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state().active_count == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.state().active_count == 0;
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.state().active_count
    }

    /// Number of jobs that reached a terminal state.
    pub fn completed_count(&self) -> usize {
        self.state().completed_total
    }

    /// Number of jobs removed before any worker claimed them.
    pub fn canceled_count(&self) -> usize {
        self.state().canceled_total
    }

    pub fn is_canceled(&self) -> bool {
        self.state().canceled
    }
}
