//! Client-side view of the coordination tree.
//!
//! [`Coordination`] is the thin interface every component talks to. It is
//! implemented directly by [`memory::MemorySession`] and
//! [`remote::RemoteSession`], and decorated by [`retry::Retrying`] to hide
//! transient connection loss.

pub mod lock;
pub mod memory;
pub mod remote;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CoordError, CoordResult};

pub use lock::DistributedLock;
pub use memory::{MemoryConnector, MemorySession, MemoryTree};
pub use remote::{RemoteConnector, RemoteSession};
pub use retry::Retrying;

/// Width of the counter appended to sequential node names.
pub const SEQUENCE_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata returned by reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Data version, bumped by every `set_data`
    pub version: i32,
    /// Owning session for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: u64,
    pub num_children: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A fired one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

/// Receiving end of watch notifications.
pub type Watcher = mpsc::UnboundedSender<WatchedEvent>;

/// Operations on a coordination tree, bound to one session.
///
/// `version: None` matches any version. Watches are one-shot: a watcher passed
/// to `exists`/`get_data` fires on the next create, data change or delete of
/// that path; a watcher passed to `get_children` fires on the next child
/// change or on deletion of the node itself.
#[async_trait]
pub trait Coordination: Send + Sync {
    fn session_id(&self) -> u64;

    /// Creates a node and returns its actual path (sequential nodes get a suffix).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String>;

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordResult<()>;

    async fn exists(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Option<Stat>>;

    async fn get_children(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Vec<String>>;

    async fn get_data(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<(Vec<u8>, Stat)>;

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> CoordResult<Stat>;
}

pub type SharedCoordination = Arc<dyn Coordination>;

#[async_trait]
impl<T: Coordination + ?Sized> Coordination for Arc<T> {
    fn session_id(&self) -> u64 {
        (**self).session_id()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        (**self).create(path, data, mode).await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordResult<()> {
        (**self).delete(path, version).await
    }

    async fn exists(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Option<Stat>> {
        (**self).exists(path, watch).await
    }

    async fn get_children(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Vec<String>> {
        (**self).get_children(path, watch).await
    }

    async fn get_data(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<(Vec<u8>, Stat)> {
        (**self).get_data(path, watch).await
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> CoordResult<Stat> {
        (**self).set_data(path, data, version).await
    }
}

/// Opens fresh sessions, used to rebuild state after a session expires.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> CoordResult<SharedCoordination>;
}

/// Normalizes a node path: leading slash, no trailing or doubled slashes.
pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Last path component.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a normalized path, `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Sequence counter of a sequential node name.
pub fn sequence_of(name: &str) -> Option<u64> {
    let name = node_name(name);
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    name[name.len() - SEQUENCE_WIDTH..].parse().ok()
}

/// Creates every missing component of `path` as a persistent node.
pub async fn ensure_path<C: Coordination + ?Sized>(coord: &C, path: &str) -> CoordResult<String> {
    let path = normalize(path);
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        if coord.exists(&current, None).await?.is_some() {
            continue;
        }
        match coord.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize("jobs//new/"), "/jobs/new");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn join_and_split() {
        assert_eq!(join("/", "jobs"), "/jobs");
        assert_eq!(join("/jobs", "new"), "/jobs/new");
        assert_eq!(node_name("/jobs/new/0000000004"), "0000000004");
        assert_eq!(parent_of("/jobs/new"), Some("/jobs"));
        assert_eq!(parent_of("/jobs"), Some("/"));
        assert_eq!(parent_of("/"), None);
    }

    #[test]
    fn sequence_numbers() {
        assert_eq!(sequence_of("0000000042"), Some(42));
        assert_eq!(sequence_of("/jobs/locks/lock-0000000007"), Some(7));
        assert_eq!(sequence_of("short"), None);
        assert_eq!(sequence_of("not-a-sequence"), None);
    }

    #[test]
    fn create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Ephemeral.is_sequential());
    }
}
