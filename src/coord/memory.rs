//! In-process coordination tree.
//!
//! [`MemoryTree`] implements the full node model: sessions, ephemeral and
//! sequential nodes, versions and one-shot watches. It backs the development
//! coordination server and every test in the crate.
//!
//! Faults can be injected per session with [`MemoryTree::fail_next`] to
//! simulate a connection that drops before or after the server applied a
//! request, and sessions can be expired on demand.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    join, node_name, parent_of, Connector, Coordination, CreateMode, EventKind, SharedCoordination,
    Stat, WatchedEvent, Watcher, SEQUENCE_WIDTH,
};
use crate::error::{CoordError, CoordResult};

/// Injected connection failure for the next operation of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The request never reaches the tree
    LoseBefore,
    /// The request is applied but the reply is lost
    LoseAfter,
}

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: u64,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: u64) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            ephemeral_owner: self.ephemeral_owner,
            num_children: self.children.len() as u32,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    ephemerals: HashSet<String>,
    faults: VecDeque<Fault>,
}

struct Registration {
    session: u64,
    watcher: Watcher,
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<String, Node>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
    data_watches: HashMap<String, Vec<Registration>>,
    child_watches: HashMap<String, Vec<Registration>>,
}

impl TreeState {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), 0));
        Self {
            nodes,
            next_session: 1,
            ..Default::default()
        }
    }

    fn check_session(&self, session: u64) -> CoordResult<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(CoordError::SessionExpired(session))
        }
    }

    fn take_fault(&mut self, session: u64) -> Option<Fault> {
        self.sessions
            .get_mut(&session)
            .and_then(|s| s.faults.pop_front())
    }

    fn register(
        watches: &mut HashMap<String, Vec<Registration>>,
        path: &str,
        session: u64,
        watcher: &Watcher,
    ) {
        let entries = watches.entry(path.to_string()).or_default();
        if !entries.iter().any(|r| r.watcher.same_channel(watcher)) {
            entries.push(Registration {
                session,
                watcher: watcher.clone(),
            });
        }
    }

    fn fire(watches: &mut HashMap<String, Vec<Registration>>, path: &str, kind: EventKind) {
        if let Some(entries) = watches.remove(path) {
            for reg in entries {
                // A dropped receiver just means nobody is waiting any more
                let _ = reg.watcher.send(WatchedEvent {
                    kind,
                    path: path.to_string(),
                });
            }
        }
    }

    fn create(
        &mut self,
        session: u64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordResult<String> {
        validate(path, mode.is_sequential())?;
        if path == "/" && !mode.is_sequential() {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        let idx = path
            .rfind('/')
            .ok_or_else(|| CoordError::InvalidPath(path.to_string()))?;
        let parent_path = if idx == 0 { "/" } else { &path[..idx] };

        let parent = self
            .nodes
            .get_mut(parent_path)
            .ok_or_else(|| CoordError::NoNode(parent_path.to_string()))?;
        if parent.ephemeral_owner != 0 {
            return Err(CoordError::NoChildrenForEphemerals(parent_path.to_string()));
        }

        let name = if mode.is_sequential() {
            let seq = parent.next_sequence;
            parent.next_sequence += 1;
            format!("{}{:0width$}", &path[idx + 1..], seq, width = SEQUENCE_WIDTH)
        } else {
            path[idx + 1..].to_string()
        };
        let full = join(parent_path, &name);
        if parent.children.contains(&name) {
            return Err(CoordError::NodeExists(full));
        }
        parent.children.insert(name);

        let owner = if mode.is_ephemeral() { session } else { 0 };
        self.nodes
            .insert(full.clone(), Node::new(data.to_vec(), owner));
        if owner != 0 {
            if let Some(s) = self.sessions.get_mut(&session) {
                s.ephemerals.insert(full.clone());
            }
        }

        Self::fire(&mut self.data_watches, &full, EventKind::NodeCreated);
        Self::fire(
            &mut self.child_watches,
            parent_path,
            EventKind::NodeChildrenChanged,
        );
        Ok(full)
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> CoordResult<()> {
        validate(path, false)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(CoordError::BadVersion(path.to_string()));
            }
        }
        if !node.children.is_empty() {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        let parent_path = parent_of(path).ok_or_else(|| CoordError::InvalidPath(path.into()))?;

        if let Some(node) = self.nodes.remove(path) {
            if node.ephemeral_owner != 0 {
                if let Some(s) = self.sessions.get_mut(&node.ephemeral_owner) {
                    s.ephemerals.remove(path);
                }
            }
        }
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.remove(node_name(path));
        }

        Self::fire(&mut self.data_watches, path, EventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, path, EventKind::NodeDeleted);
        Self::fire(
            &mut self.child_watches,
            parent_path,
            EventKind::NodeChildrenChanged,
        );
        Ok(())
    }

    fn exists(&mut self, session: u64, path: &str, watch: Option<&Watcher>) -> CoordResult<Option<Stat>> {
        validate(path, false)?;
        if let Some(w) = watch {
            Self::register(&mut self.data_watches, path, session, w);
        }
        Ok(self.nodes.get(path).map(Node::stat))
    }

    fn get_children(
        &mut self,
        session: u64,
        path: &str,
        watch: Option<&Watcher>,
    ) -> CoordResult<Vec<String>> {
        validate(path, false)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        let children = node.children.iter().cloned().collect();
        if let Some(w) = watch {
            Self::register(&mut self.child_watches, path, session, w);
        }
        Ok(children)
    }

    fn get_data(
        &mut self,
        session: u64,
        path: &str,
        watch: Option<&Watcher>,
    ) -> CoordResult<(Vec<u8>, Stat)> {
        validate(path, false)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        let result = (node.data.clone(), node.stat());
        if let Some(w) = watch {
            Self::register(&mut self.data_watches, path, session, w);
        }
        Ok(result)
    }

    fn set_data(&mut self, path: &str, data: &[u8], version: Option<i32>) -> CoordResult<Stat> {
        validate(path, false)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(CoordError::BadVersion(path.to_string()));
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        let stat = node.stat();
        Self::fire(&mut self.data_watches, path, EventKind::NodeDataChanged);
        Ok(stat)
    }

    fn end_session(&mut self, session: u64) -> bool {
        let Some(state) = self.sessions.remove(&session) else {
            return false;
        };
        for entries in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            entries.retain(|r| r.session != session);
        }
        let mut ephemerals: Vec<String> = state.ephemerals.into_iter().collect();
        ephemerals.sort();
        for path in ephemerals {
            if let Err(e) = self.delete(&path, None) {
                tracing::warn!(session, path = %path, error = %e, "Failed to remove ephemeral node");
            }
        }
        true
    }
}

fn validate(path: &str, sequential: bool) -> CoordResult<()> {
    let invalid = || CoordError::InvalidPath(path.to_string());
    if !path.starts_with('/') {
        return Err(invalid());
    }
    if path == "/" {
        return Ok(());
    }
    let body = if sequential && path.ends_with('/') {
        &path[1..path.len() - 1]
    } else {
        &path[1..]
    };
    if !body.is_empty() && body.split('/').any(|p| p.is_empty()) {
        return Err(invalid());
    }
    Ok(())
}

fn poison_err<T>(_: PoisonError<T>) -> CoordError {
    CoordError::Internal("coordination tree lock poisoned".to_string())
}

/// Shared handle to an in-memory coordination tree.
#[derive(Clone)]
pub struct MemoryTree {
    state: Arc<Mutex<TreeState>>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTree").finish_non_exhaustive()
    }
}

impl MemoryTree {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TreeState::new())),
        }
    }

    fn lock(&self) -> CoordResult<MutexGuard<'_, TreeState>> {
        self.state.lock().map_err(poison_err)
    }

    /// Opens a new session and returns its id.
    pub fn open_session(&self) -> CoordResult<u64> {
        let mut state = self.lock()?;
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id, SessionState::default());
        tracing::debug!(session = id, "Session opened");
        Ok(id)
    }

    /// Opens a new session bound to this tree.
    pub fn session(&self) -> CoordResult<MemorySession> {
        let id = self.open_session()?;
        Ok(MemorySession {
            tree: self.clone(),
            id,
        })
    }

    /// Expires a session: its watches are dropped and its ephemeral nodes
    /// deleted. Returns false if the session was not live.
    pub fn expire_session(&self, session: u64) -> CoordResult<bool> {
        let ended = self.lock()?.end_session(session);
        if ended {
            tracing::info!(session, "Session expired");
        }
        Ok(ended)
    }

    pub fn is_live(&self, session: u64) -> CoordResult<bool> {
        Ok(self.lock()?.sessions.contains_key(&session))
    }

    /// Queues a connection fault for the session's next operation.
    pub fn fail_next(&self, session: u64, fault: Fault) -> CoordResult<()> {
        let mut state = self.lock()?;
        state.check_session(session)?;
        if let Some(s) = state.sessions.get_mut(&session) {
            s.faults.push_back(fault);
        }
        Ok(())
    }

    /// Runs one operation for `session`, applying any injected fault.
    fn run<T>(
        &self,
        session: u64,
        op: impl FnOnce(&mut TreeState) -> CoordResult<T>,
    ) -> CoordResult<T> {
        let mut state = self.lock()?;
        state.check_session(session)?;
        match state.take_fault(session) {
            Some(Fault::LoseBefore) => Err(CoordError::ConnectionLoss),
            Some(Fault::LoseAfter) => {
                let _ = op(&mut state);
                Err(CoordError::ConnectionLoss)
            }
            None => op(&mut state),
        }
    }

    pub fn create(
        &self,
        session: u64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordResult<String> {
        self.run(session, |s| s.create(session, path, data, mode))
    }

    pub fn delete(&self, session: u64, path: &str, version: Option<i32>) -> CoordResult<()> {
        self.run(session, |s| s.delete(path, version))
    }

    pub fn exists(
        &self,
        session: u64,
        path: &str,
        watch: Option<&Watcher>,
    ) -> CoordResult<Option<Stat>> {
        self.run(session, |s| s.exists(session, path, watch))
    }

    pub fn get_children(
        &self,
        session: u64,
        path: &str,
        watch: Option<&Watcher>,
    ) -> CoordResult<Vec<String>> {
        self.run(session, |s| s.get_children(session, path, watch))
    }

    pub fn get_data(
        &self,
        session: u64,
        path: &str,
        watch: Option<&Watcher>,
    ) -> CoordResult<(Vec<u8>, Stat)> {
        self.run(session, |s| s.get_data(session, path, watch))
    }

    pub fn set_data(
        &self,
        session: u64,
        path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> CoordResult<Stat> {
        self.run(session, |s| s.set_data(path, data, version))
    }
}

/// A session on a [`MemoryTree`].
#[derive(Debug)]
pub struct MemorySession {
    tree: MemoryTree,
    id: u64,
}

impl MemorySession {
    pub fn tree(&self) -> &MemoryTree {
        &self.tree
    }

    /// Ends the session, removing its ephemeral nodes.
    pub fn close(&self) -> CoordResult<()> {
        self.tree.expire_session(self.id).map(|_| ())
    }
}

#[async_trait]
impl Coordination for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        self.tree.create(self.id, path, data, mode)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordResult<()> {
        self.tree.delete(self.id, path, version)
    }

    async fn exists(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Option<Stat>> {
        self.tree.exists(self.id, path, watch)
    }

    async fn get_children(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Vec<String>> {
        self.tree.get_children(self.id, path, watch)
    }

    async fn get_data(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<(Vec<u8>, Stat)> {
        self.tree.get_data(self.id, path, watch)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> CoordResult<Stat> {
        self.tree.set_data(self.id, path, data, version)
    }
}

/// Opens fresh sessions on a shared [`MemoryTree`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tree: MemoryTree,
}

impl MemoryConnector {
    pub fn new(tree: MemoryTree) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> CoordResult<SharedCoordination> {
        Ok(Arc::new(self.tree.session()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn tree_with_session() -> (MemoryTree, MemorySession) {
        let tree = MemoryTree::new();
        let session = tree.session().unwrap();
        (tree, session)
    }

    #[tokio::test]
    async fn sequential_names_are_zero_padded_and_monotonic() {
        let (_tree, s) = tree_with_session();
        s.create("/q", &[], CreateMode::Persistent).await.unwrap();

        let a = s.create("/q/", b"a", CreateMode::PersistentSequential).await.unwrap();
        let b = s.create("/q/job-", b"b", CreateMode::EphemeralSequential).await.unwrap();
        assert_eq!(a, "/q/0000000000");
        assert_eq!(b, "/q/job-0000000001");

        s.delete(&a, None).await.unwrap();
        let c = s.create("/q/", b"c", CreateMode::PersistentSequential).await.unwrap();
        assert_eq!(c, "/q/0000000002");
    }

    #[tokio::test]
    async fn create_requires_parent_and_rejects_duplicates() {
        let (_tree, s) = tree_with_session();
        let err = s.create("/a/b", &[], CreateMode::Persistent).await.unwrap_err();
        assert_eq!(err, CoordError::NoNode("/a".into()));

        s.create("/a", &[], CreateMode::Persistent).await.unwrap();
        let err = s.create("/a", &[], CreateMode::Persistent).await.unwrap_err();
        assert_eq!(err, CoordError::NodeExists("/a".into()));

        s.create("/e", &[], CreateMode::Ephemeral).await.unwrap();
        let err = s.create("/e/x", &[], CreateMode::Persistent).await.unwrap_err();
        assert!(matches!(err, CoordError::NoChildrenForEphemerals(_)));

        let err = s.create("relative", &[], CreateMode::Persistent).await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn versioned_delete_and_set() {
        let (_tree, s) = tree_with_session();
        s.create("/n", b"", CreateMode::Persistent).await.unwrap();

        let stat = s.set_data("/n", b"x", Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);
        let err = s.set_data("/n", b"y", Some(0)).await.unwrap_err();
        assert_eq!(err, CoordError::BadVersion("/n".into()));

        let err = s.delete("/n", Some(0)).await.unwrap_err();
        assert!(matches!(err, CoordError::BadVersion(_)));
        s.delete("/n", Some(1)).await.unwrap();
        assert!(s.exists("/n", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_refuses_non_empty_node() {
        let (_tree, s) = tree_with_session();
        s.create("/p", &[], CreateMode::Persistent).await.unwrap();
        s.create("/p/c", &[], CreateMode::Persistent).await.unwrap();
        let err = s.delete("/p", None).await.unwrap_err();
        assert_eq!(err, CoordError::NotEmpty("/p".into()));
    }

    #[tokio::test]
    async fn watches_fire_once() {
        let (_tree, s) = tree_with_session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(s.exists("/w", Some(&tx)).await.unwrap().is_none());
        // Same channel registered twice still fires once
        s.exists("/w", Some(&tx)).await.unwrap();
        s.create("/w", &[], CreateMode::Persistent).await.unwrap();
        s.set_data("/w", b"1", None).await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent {
                kind: EventKind::NodeCreated,
                path: "/w".into()
            }
        );
        assert!(rx.try_recv().is_err());

        s.get_data("/w", Some(&tx)).await.unwrap();
        s.set_data("/w", b"2", None).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::NodeDataChanged);

        s.get_children("/", Some(&tx)).await.unwrap();
        s.get_children("/w", Some(&tx)).await.unwrap();
        s.delete("/w", None).await.unwrap();
        let mut kinds = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        kinds.sort_by_key(|e| e.path.clone());
        assert_eq!(kinds[0].kind, EventKind::NodeChildrenChanged);
        assert_eq!(kinds[0].path, "/");
        assert_eq!(kinds[1].kind, EventKind::NodeDeleted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expiry_removes_ephemerals_and_fires_watches() {
        let tree = MemoryTree::new();
        let owner = tree.session().unwrap();
        let observer = tree.session().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let path = owner.create("/lease", &[], CreateMode::Ephemeral).await.unwrap();
        let stat = observer.exists(&path, Some(&tx)).await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, owner.session_id());

        assert!(tree.expire_session(owner.session_id()).unwrap());
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::NodeDeleted);
        assert!(observer.exists(&path, None).await.unwrap().is_none());

        let err = owner.get_children("/", None).await.unwrap_err();
        assert_eq!(err, CoordError::SessionExpired(owner.session_id()));
        assert!(!tree.expire_session(owner.session_id()).unwrap());
    }

    #[tokio::test]
    async fn expired_session_watches_are_dropped() {
        let tree = MemoryTree::new();
        let a = tree.session().unwrap();
        let b = tree.session().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        a.exists("/x", Some(&tx)).await.unwrap();
        tree.expire_session(a.session_id()).unwrap();
        b.create("/x", &[], CreateMode::Persistent).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn injected_faults() {
        let (tree, s) = tree_with_session();

        tree.fail_next(s.session_id(), Fault::LoseBefore).unwrap();
        let err = s.create("/a", &[], CreateMode::Persistent).await.unwrap_err();
        assert!(err.is_connection_loss());
        assert!(s.exists("/a", None).await.unwrap().is_none());

        tree.fail_next(s.session_id(), Fault::LoseAfter).unwrap();
        let err = s.create("/a", &[], CreateMode::Persistent).await.unwrap_err();
        assert!(err.is_connection_loss());
        assert!(s.exists("/a", None).await.unwrap().is_some());
    }
}
