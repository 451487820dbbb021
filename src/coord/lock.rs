//! FIFO mutual exclusion on ephemeral-sequential nodes.
//!
//! Each attempt creates one node under the lock directory and waits on its
//! precursor, the node with the greatest sequence number below its own.
//! Contenders are therefore granted strictly in sequence order, and a holder
//! that loses its session releases the lock implicitly.

use std::time::Duration;

use tokio::sync::mpsc;

use super::{
    join, node_name, sequence_of, Coordination, CreateMode, SharedCoordination, WatchedEvent,
};
use crate::error::{CoordError, CoordResult};

/// Pause before retrying after a transient failure inside the wait loop.
const RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct DistributedLock {
    coord: SharedCoordination,
    dir: String,
    wait: Duration,
}

enum Step {
    Granted,
    Retry,
}

impl DistributedLock {
    /// `dir` must already exist. `wait` bounds each sleep on the precursor's
    /// watch in case a notification is missed.
    pub fn new(coord: SharedCoordination, dir: impl Into<String>, wait: Duration) -> Self {
        Self {
            coord,
            dir: dir.into(),
            wait,
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Blocks until this attempt holds the lock.
    ///
    /// On any non-transient error the attempt's node is removed before the
    /// error is returned.
    pub async fn lock(&self) -> CoordResult<LockGuard> {
        let node = self
            .coord
            .create(&format!("{}/", self.dir), &[], CreateMode::EphemeralSequential)
            .await?;
        let seq = sequence_of(&node)
            .ok_or_else(|| CoordError::Internal(format!("lock node without sequence: {}", node)))?;
        tracing::debug!(node = %node, "Lock pending");

        let (tx, mut rx) = mpsc::unbounded_channel();
        loop {
            match self.step(&node, seq, &tx, &mut rx).await {
                Ok(Step::Granted) => {
                    tracing::debug!(node = %node, "Lock held");
                    return Ok(LockGuard {
                        coord: self.coord.clone(),
                        node,
                        released: false,
                    });
                }
                Ok(Step::Retry) => {}
                Err(CoordError::ConnectionLoss) => {
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "Lock attempt failed");
                    if let Err(cleanup) = release(&self.coord, &node).await {
                        tracing::debug!(node = %node, error = %cleanup, "Could not remove lock node");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn step(
        &self,
        node: &str,
        seq: u64,
        tx: &mpsc::UnboundedSender<WatchedEvent>,
        rx: &mut mpsc::UnboundedReceiver<WatchedEvent>,
    ) -> CoordResult<Step> {
        let own = node_name(node);
        let mut contenders: Vec<(u64, String)> = self
            .coord
            .get_children(&self.dir, None)
            .await?
            .into_iter()
            .filter_map(|name| sequence_of(&name).map(|s| (s, name)))
            .collect();
        contenders.sort();

        if !contenders.iter().any(|(_, name)| name == own) {
            return Err(CoordError::NoNode(node.to_string()));
        }

        let Some((_, precursor)) = contenders.iter().rev().find(|(s, _)| *s < seq) else {
            return Ok(Step::Granted);
        };

        if let Some((_, lowest)) = contenders.first() {
            if lowest != own {
                self.break_stale(&join(&self.dir, lowest)).await?;
            }
        }

        let precursor = join(&self.dir, precursor);
        if self.coord.exists(&precursor, Some(tx)).await?.is_none() {
            return Ok(Step::Retry);
        }
        tracing::trace!(node = %node, precursor = %precursor, "Waiting on precursor");
        // A timeout is fine: the loop re-reads the children either way
        let _ = tokio::time::timeout(self.wait, rx.recv()).await;
        Ok(Step::Retry)
    }

    /// Removes the lowest node if it belongs to our own session but not to
    /// this attempt, i.e. it was left behind by an earlier attempt whose
    /// reply was lost.
    async fn break_stale(&self, lowest: &str) -> CoordResult<()> {
        let Some(stat) = self.coord.exists(lowest, None).await? else {
            return Ok(());
        };
        if stat.ephemeral_owner != self.coord.session_id() {
            return Ok(());
        }
        tracing::warn!(node = %lowest, "Removing stale lock node from this session");
        match self.coord.delete(lowest, None).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn release(coord: &SharedCoordination, node: &str) -> CoordResult<()> {
    match coord.delete(node, None).await {
        Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// A held lock. Call [`LockGuard::unlock`] to release it.
///
/// Dropping a guard without unlocking schedules a best-effort release on the
/// current runtime.
pub struct LockGuard {
    coord: SharedCoordination,
    node: String,
    released: bool,
}

impl LockGuard {
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Deletes the lock node. Succeeds if the node is already gone.
    pub async fn unlock(mut self) -> CoordResult<()> {
        self.released = true;
        let result = release(&self.coord, &self.node).await;
        tracing::debug!(node = %self.node, "Lock released");
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let coord = self.coord.clone();
        let node = std::mem::take(&mut self.node);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = release(&coord, &node).await {
                    tracing::warn!(node = %node, error = %e, "Failed to release dropped lock");
                }
            });
        }
    }
}
