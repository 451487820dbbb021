//! gRPC client for the coordination server.
//!
//! A [`RemoteSession`] keeps one server stream open per session. Watch
//! notifications arrive on that stream and are dispatched to the local
//! watchers registered for the path. If the stream drops, the session is
//! resumed under the same id until the session timeout runs out, after which
//! every operation fails with `SessionExpired`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::transport::Channel;
use tonic::{Code, Status, Streaming};

use super::{
    Connector, Coordination, CreateMode, EventKind, SharedCoordination, Stat, WatchedEvent,
    Watcher,
};
use crate::error::{CoordError, CoordResult};
use crate::proto;
use crate::proto::tree_service_client::TreeServiceClient;

const RESUME_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Category {
    Data,
    Child,
}

/// Local fan-out of one-shot watches, keyed by path and watch category.
#[derive(Default)]
struct WatchRegistry {
    entries: HashMap<(String, Category), Vec<Watcher>>,
}

impl WatchRegistry {
    fn add(&mut self, path: &str, category: Category, watcher: &Watcher) {
        let list = self.entries.entry((path.to_string(), category)).or_default();
        if !list.iter().any(|w| w.same_channel(watcher)) {
            list.push(watcher.clone());
        }
    }

    fn remove(&mut self, path: &str, category: Category, watcher: &Watcher) {
        let key = (path.to_string(), category);
        if let Some(list) = self.entries.get_mut(&key) {
            list.retain(|w| !w.same_channel(watcher));
            if list.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    fn dispatch(&mut self, kind: EventKind, path: &str) {
        let categories: &[Category] = match kind {
            EventKind::NodeCreated | EventKind::NodeDataChanged => &[Category::Data],
            EventKind::NodeChildrenChanged => &[Category::Child],
            EventKind::NodeDeleted => &[Category::Data, Category::Child],
        };
        for category in categories {
            if let Some(list) = self.entries.remove(&(path.to_string(), *category)) {
                for watcher in list {
                    let _ = watcher.send(WatchedEvent {
                        kind,
                        path: path.to_string(),
                    });
                }
            }
        }
    }
}

/// A session on a remote coordination server.
pub struct RemoteSession {
    client: TreeServiceClient<Channel>,
    session_id: u64,
    watches: Arc<Mutex<WatchRegistry>>,
    expired: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl RemoteSession {
    /// Connects to `endpoint` and opens a new session.
    pub async fn connect(endpoint: &str, session_timeout: Duration) -> CoordResult<Self> {
        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| CoordError::Internal(format!("invalid endpoint {}: {}", endpoint, e)))?
            .connect()
            .await
            .map_err(|e| {
                tracing::debug!(endpoint, error = %e, "Failed to connect to coordination server");
                CoordError::ConnectionLoss
            })?;
        let mut client = TreeServiceClient::new(channel);

        let timeout_ms = session_timeout.as_millis() as u64;
        let mut stream = client
            .open_session(proto::OpenSessionRequest {
                session_id: 0,
                timeout_ms,
            })
            .await
            .map_err(|s| status_to_error(s, 0))?
            .into_inner();
        let opened = stream
            .message()
            .await
            .map_err(|s| status_to_error(s, 0))?
            .ok_or(CoordError::ConnectionLoss)?;
        let session_id = opened.session_id;
        tracing::info!(session = session_id, endpoint, "Coordination session opened");

        let watches = Arc::new(Mutex::new(WatchRegistry::default()));
        let expired = Arc::new(AtomicBool::new(false));
        let listener = tokio::spawn(listen(
            client.clone(),
            session_id,
            session_timeout,
            stream,
            watches.clone(),
            expired.clone(),
        ));

        Ok(Self {
            client,
            session_id,
            watches,
            expired,
            listener,
        })
    }

    /// Closes the session on the server, removing its ephemeral nodes.
    pub async fn close(&self) -> CoordResult<()> {
        self.listener.abort();
        self.client
            .clone()
            .close_session(proto::CloseSessionRequest {
                session_id: self.session_id,
            })
            .await
            .map_err(|s| status_to_error(s, self.session_id))?;
        Ok(())
    }

    fn check_live(&self) -> CoordResult<()> {
        if self.expired.load(Ordering::Acquire) {
            Err(CoordError::SessionExpired(self.session_id))
        } else {
            Ok(())
        }
    }

    fn watch(&self, path: &str, category: Category, watcher: Option<&Watcher>) {
        if let (Some(w), Ok(mut reg)) = (watcher, self.watches.lock()) {
            reg.add(path, category, w);
        }
    }

    fn unwatch(&self, path: &str, category: Category, watcher: Option<&Watcher>) {
        if let (Some(w), Ok(mut reg)) = (watcher, self.watches.lock()) {
            reg.remove(path, category, w);
        }
    }

    fn status(&self, status: Status) -> CoordError {
        status_to_error(status, self.session_id)
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    mut client: TreeServiceClient<Channel>,
    session_id: u64,
    session_timeout: Duration,
    mut stream: Streaming<proto::SessionEvent>,
    watches: Arc<Mutex<WatchRegistry>>,
    expired: Arc<AtomicBool>,
) {
    loop {
        match stream.message().await {
            Ok(Some(event)) => {
                let Some(kind) = event_kind(event.kind()) else {
                    continue;
                };
                tracing::trace!(session = session_id, path = %event.path, ?kind, "Watch fired");
                if let Ok(mut reg) = watches.lock() {
                    reg.dispatch(kind, &event.path);
                }
            }
            Ok(None) | Err(_) => {
                tracing::warn!(session = session_id, "Session stream lost, resuming");
                match resume(&mut client, session_id, session_timeout).await {
                    Some(resumed) => stream = resumed,
                    None => {
                        tracing::error!(session = session_id, "Coordination session expired");
                        expired.store(true, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }
}

async fn resume(
    client: &mut TreeServiceClient<Channel>,
    session_id: u64,
    session_timeout: Duration,
) -> Option<Streaming<proto::SessionEvent>> {
    let deadline = Instant::now() + session_timeout;
    while Instant::now() < deadline {
        tokio::time::sleep(RESUME_BACKOFF).await;
        let request = proto::OpenSessionRequest {
            session_id,
            timeout_ms: session_timeout.as_millis() as u64,
        };
        match client.open_session(request).await {
            Ok(resp) => {
                tracing::info!(session = session_id, "Session resumed");
                return Some(resp.into_inner());
            }
            Err(status) if status.code() == Code::NotFound => return None,
            Err(status) => {
                tracing::debug!(session = session_id, error = %status, "Resume attempt failed");
            }
        }
    }
    None
}

fn event_kind(kind: proto::EventKind) -> Option<EventKind> {
    match kind {
        proto::EventKind::SessionOpened => None,
        proto::EventKind::NodeCreated => Some(EventKind::NodeCreated),
        proto::EventKind::NodeDeleted => Some(EventKind::NodeDeleted),
        proto::EventKind::NodeDataChanged => Some(EventKind::NodeDataChanged),
        proto::EventKind::NodeChildrenChanged => Some(EventKind::NodeChildrenChanged),
    }
}

/// Maps a transport status to the coordination error taxonomy.
pub(crate) fn status_to_error(status: Status, session_id: u64) -> CoordError {
    match status.code() {
        Code::Unavailable | Code::Cancelled | Code::DeadlineExceeded | Code::Unknown => {
            CoordError::ConnectionLoss
        }
        Code::NotFound => CoordError::SessionExpired(session_id),
        _ => CoordError::Internal(status.message().to_string()),
    }
}

/// Maps an error code carried in a response body.
pub(crate) fn code_to_result(
    code: proto::ErrorCode,
    path: &str,
    session_id: u64,
) -> CoordResult<()> {
    let path = path.to_string();
    match code {
        proto::ErrorCode::Ok => Ok(()),
        proto::ErrorCode::NoNode => Err(CoordError::NoNode(path)),
        proto::ErrorCode::NodeExists => Err(CoordError::NodeExists(path)),
        proto::ErrorCode::BadVersion => Err(CoordError::BadVersion(path)),
        proto::ErrorCode::NotEmpty => Err(CoordError::NotEmpty(path)),
        proto::ErrorCode::NoChildrenForEphemerals => Err(CoordError::NoChildrenForEphemerals(path)),
        proto::ErrorCode::InvalidPath => Err(CoordError::InvalidPath(path)),
        proto::ErrorCode::SessionExpired => Err(CoordError::SessionExpired(session_id)),
    }
}

/// Inverse of [`code_to_result`], used by the server.
pub(crate) fn error_to_code(err: &CoordError) -> Option<proto::ErrorCode> {
    match err {
        CoordError::NoNode(_) => Some(proto::ErrorCode::NoNode),
        CoordError::NodeExists(_) => Some(proto::ErrorCode::NodeExists),
        CoordError::BadVersion(_) => Some(proto::ErrorCode::BadVersion),
        CoordError::NotEmpty(_) => Some(proto::ErrorCode::NotEmpty),
        CoordError::NoChildrenForEphemerals(_) => Some(proto::ErrorCode::NoChildrenForEphemerals),
        CoordError::InvalidPath(_) => Some(proto::ErrorCode::InvalidPath),
        CoordError::SessionExpired(_) => Some(proto::ErrorCode::SessionExpired),
        CoordError::ConnectionLoss | CoordError::Internal(_) => None,
    }
}

pub(crate) fn wire_mode(mode: CreateMode) -> proto::CreateMode {
    match mode {
        CreateMode::Persistent => proto::CreateMode::Persistent,
        CreateMode::Ephemeral => proto::CreateMode::Ephemeral,
        CreateMode::PersistentSequential => proto::CreateMode::PersistentSequential,
        CreateMode::EphemeralSequential => proto::CreateMode::EphemeralSequential,
    }
}

pub(crate) fn local_mode(mode: proto::CreateMode) -> CreateMode {
    match mode {
        proto::CreateMode::Persistent => CreateMode::Persistent,
        proto::CreateMode::Ephemeral => CreateMode::Ephemeral,
        proto::CreateMode::PersistentSequential => CreateMode::PersistentSequential,
        proto::CreateMode::EphemeralSequential => CreateMode::EphemeralSequential,
    }
}

fn wire_version(version: Option<i32>) -> i32 {
    version.unwrap_or(-1)
}

fn local_stat(stat: Option<proto::Stat>) -> Stat {
    stat.map(|s| Stat {
        version: s.version,
        ephemeral_owner: s.ephemeral_owner,
        num_children: s.num_children,
    })
    .unwrap_or_default()
}

#[async_trait]
impl Coordination for RemoteSession {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        self.check_live()?;
        let resp = self
            .client
            .clone()
            .create(proto::CreateRequest {
                session_id: self.session_id,
                path: path.to_string(),
                data: data.to_vec(),
                mode: wire_mode(mode) as i32,
            })
            .await
            .map_err(|s| self.status(s))?
            .into_inner();
        code_to_result(resp.error(), path, self.session_id)?;
        Ok(resp.path)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordResult<()> {
        self.check_live()?;
        let resp = self
            .client
            .clone()
            .delete(proto::DeleteRequest {
                session_id: self.session_id,
                path: path.to_string(),
                version: wire_version(version),
            })
            .await
            .map_err(|s| self.status(s))?
            .into_inner();
        code_to_result(resp.error(), path, self.session_id)
    }

    async fn exists(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Option<Stat>> {
        self.check_live()?;
        // Registered before the request so an event racing the reply is not lost
        self.watch(path, Category::Data, watch);
        let result = self
            .client
            .clone()
            .exists(proto::ExistsRequest {
                session_id: self.session_id,
                path: path.to_string(),
                watch: watch.is_some(),
            })
            .await
            .map_err(|s| self.status(s))
            .map(tonic::Response::into_inner);
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.unwatch(path, Category::Data, watch);
                return Err(e);
            }
        };
        match code_to_result(resp.error(), path, self.session_id) {
            Ok(()) => Ok(resp.stat.map(|s| local_stat(Some(s)))),
            Err(CoordError::NoNode(_)) => Ok(None),
            Err(e) => {
                self.unwatch(path, Category::Data, watch);
                Err(e)
            }
        }
    }

    async fn get_children(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Vec<String>> {
        self.check_live()?;
        self.watch(path, Category::Child, watch);
        let result = self
            .client
            .clone()
            .get_children(proto::GetChildrenRequest {
                session_id: self.session_id,
                path: path.to_string(),
                watch: watch.is_some(),
            })
            .await
            .map_err(|s| self.status(s))
            .and_then(|resp| {
                let resp = resp.into_inner();
                code_to_result(resp.error(), path, self.session_id).map(|_| resp.children)
            });
        if result.is_err() {
            self.unwatch(path, Category::Child, watch);
        }
        result
    }

    async fn get_data(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<(Vec<u8>, Stat)> {
        self.check_live()?;
        self.watch(path, Category::Data, watch);
        let result = self
            .client
            .clone()
            .get_data(proto::GetDataRequest {
                session_id: self.session_id,
                path: path.to_string(),
                watch: watch.is_some(),
            })
            .await
            .map_err(|s| self.status(s))
            .and_then(|resp| {
                let resp = resp.into_inner();
                code_to_result(resp.error(), path, self.session_id)
                    .map(|_| (resp.data, local_stat(resp.stat)))
            });
        if result.is_err() {
            self.unwatch(path, Category::Data, watch);
        }
        result
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> CoordResult<Stat> {
        self.check_live()?;
        let resp = self
            .client
            .clone()
            .set_data(proto::SetDataRequest {
                session_id: self.session_id,
                path: path.to_string(),
                data: data.to_vec(),
                version: wire_version(version),
            })
            .await
            .map_err(|s| self.status(s))?
            .into_inner();
        code_to_result(resp.error(), path, self.session_id)?;
        Ok(local_stat(resp.stat))
    }
}

/// Opens sessions on a remote coordination server.
#[derive(Debug, Clone)]
pub struct RemoteConnector {
    endpoint: String,
    session_timeout: Duration,
}

impl RemoteConnector {
    pub fn new(endpoint: impl Into<String>, session_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_timeout,
        }
    }
}

#[async_trait]
impl Connector for RemoteConnector {
    async fn connect(&self) -> CoordResult<SharedCoordination> {
        let session = RemoteSession::connect(&self.endpoint, self.session_timeout).await?;
        Ok(Arc::new(session))
    }
}
