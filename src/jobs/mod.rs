pub mod claim;
pub mod submission;

pub use claim::{ClaimOutcome, JobClaimQueue};
pub use submission::{JobSubmissionQueue, Submission};

use serde::{Deserialize, Serialize};

use crate::coord::{ensure_path, join, normalize, Coordination};
use crate::error::{CoordResult, Result};

/// Everything a worker needs to scan one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Shard path on the shared filesystem
    pub input: String,
    /// Hosts holding a replica of the shard
    pub hosts: Vec<String>,
    pub filter: String,
    pub args: Vec<String>,
}

impl JobDescriptor {
    pub fn new(
        input: impl Into<String>,
        hosts: Vec<String>,
        filter: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            input: input.into(),
            hosts,
            filter: filter.into(),
            args,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// True if `host` holds a local replica of the shard.
    pub fn is_eligible(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }
}

/// Payload of a job's `active` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    /// Claimed, still running
    Pending,
    Done,
    Failed,
}

impl ActiveState {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            b"" => Some(ActiveState::Pending),
            b"done" => Some(ActiveState::Done),
            b"failed" => Some(ActiveState::Failed),
            _ => None,
        }
    }

    pub fn payload(self) -> &'static [u8] {
        match self {
            ActiveState::Pending => b"",
            ActiveState::Done => b"done",
            ActiveState::Failed => b"failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ActiveState::Done | ActiveState::Failed)
    }
}

impl std::fmt::Display for ActiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActiveState::Pending => write!(f, "pending"),
            ActiveState::Done => write!(f, "done"),
            ActiveState::Failed => write!(f, "failed"),
        }
    }
}

/// Node layout of the job tree below the coordination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub base: String,
    pub new: String,
    pub active: String,
    pub locks: String,
}

impl JobPaths {
    pub fn new(root: &str, jobs_dir: &str) -> Self {
        let base = normalize(&join(&normalize(root), jobs_dir));
        Self {
            new: join(&base, "new"),
            active: join(&base, "active"),
            locks: join(&base, "locks"),
            base,
        }
    }

    /// Creates any missing node of the layout.
    pub async fn ensure<C: Coordination + ?Sized>(&self, coord: &C) -> CoordResult<()> {
        for path in [&self.new, &self.active, &self.locks] {
            ensure_path(coord, path).await?;
        }
        Ok(())
    }

    pub fn new_job(&self, id: &str) -> String {
        join(&self.new, id)
    }

    pub fn active_job(&self, id: &str) -> String {
        join(&self.active, id)
    }
}

/// A job claimed by this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: String,
    pub descriptor: JobDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryTree;

    #[test]
    fn descriptor_codec() {
        let job = JobDescriptor::new(
            "/data/2024/03/shard-17",
            vec!["dn1".into(), "dn4".into()],
            "proto tcp and port 443",
            vec!["-a".into(), "-o".into(), "long".into()],
        );
        let decoded = JobDescriptor::decode(&job.encode().unwrap()).unwrap();
        assert_eq!(decoded, job);
        assert!(decoded.is_eligible("dn4"));
        assert!(!decoded.is_eligible("dn2"));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(JobDescriptor::decode(&[0xff, 0x01]).is_err());
    }

    #[test]
    fn active_state_payloads() {
        assert_eq!(ActiveState::from_payload(b""), Some(ActiveState::Pending));
        assert_eq!(ActiveState::from_payload(b"done"), Some(ActiveState::Done));
        assert_eq!(ActiveState::from_payload(b"failed"), Some(ActiveState::Failed));
        assert_eq!(ActiveState::from_payload(b"bogus"), None);
        assert!(!ActiveState::Pending.is_terminal());
        assert!(ActiveState::Failed.is_terminal());
        assert_eq!(ActiveState::Done.payload(), b"done");
    }

    #[test]
    fn paths_layout() {
        let paths = JobPaths::new("/sharddist/", "jobs");
        assert_eq!(paths.base, "/sharddist/jobs");
        assert_eq!(paths.new_job("0000000003"), "/sharddist/jobs/new/0000000003");
        assert_eq!(paths.active_job("0000000003"), "/sharddist/jobs/active/0000000003");
        assert_eq!(paths.locks, "/sharddist/jobs/locks");
    }

    #[tokio::test]
    async fn ensure_creates_layout_once() {
        let tree = MemoryTree::new();
        let session = tree.session().unwrap();
        let paths = JobPaths::new("/sd", "jobs");
        paths.ensure(&session).await.unwrap();
        paths.ensure(&session).await.unwrap();

        let mut children = session.get_children("/sd/jobs", None).await.unwrap();
        children.sort();
        assert_eq!(children, vec!["active", "locks", "new"]);
    }
}
