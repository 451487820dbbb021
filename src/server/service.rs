use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::coord::memory::MemoryTree;
use crate::coord::remote::{error_to_code, local_mode};
use crate::coord::{EventKind, Stat, WatchedEvent, Watcher};
use crate::error::{CoordError, CoordResult};
use crate::proto;
use crate::proto::tree_service_server::TreeService;

type EventStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<proto::SessionEvent, Status>> + Send>>;

/// Server-side state of one client session.
struct SessionLink {
    /// Registered with the tree for every watch this session sets
    watcher: Watcher,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchedEvent>>>,
    timeout: Duration,
    /// Bumped on every attach so a stale expiry timer can tell it lost the race
    generation: u64,
    attached: bool,
}

/// One `OpenSession` stream bound to a session.
struct Attachment {
    session_id: u64,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchedEvent>>>,
    generation: u64,
}

/// Coordination tree exposed over gRPC.
///
/// Each session owns one stable watch channel. The currently attached
/// `OpenSession` stream forwards from it; when the stream drops the session
/// expires after its timeout unless a client resumes it first.
#[derive(Clone)]
pub struct TreeServiceImpl {
    tree: MemoryTree,
    sessions: Arc<Mutex<HashMap<u64, SessionLink>>>,
    max_session_timeout: Duration,
}

impl TreeServiceImpl {
    pub fn new(tree: MemoryTree, max_session_timeout: Duration) -> Self {
        Self {
            tree,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max_session_timeout,
        }
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<u64, SessionLink>>, Status> {
        self.sessions
            .lock()
            .map_err(|_| Status::internal("session table poisoned"))
    }

    /// Watcher to register for a request, if it asked for one.
    fn watcher(&self, session_id: u64, watch: bool) -> Result<Option<Watcher>, Status> {
        if !watch {
            return Ok(None);
        }
        Ok(self
            .sessions()?
            .get(&session_id)
            .map(|link| link.watcher.clone()))
    }

    /// Opens or resumes a session. Returns its id, its event receiver and
    /// the generation of this attachment.
    fn attach(&self, session_id: u64, requested: Duration) -> Result<Attachment, Status> {
        let timeout = requested.min(self.max_session_timeout);
        let mut sessions = self.sessions()?;
        if session_id == 0 {
            let id = self.tree.open_session().map_err(internal)?;
            let (watcher, rx) = mpsc::unbounded_channel();
            let events = Arc::new(tokio::sync::Mutex::new(rx));
            sessions.insert(
                id,
                SessionLink {
                    watcher,
                    events: events.clone(),
                    timeout,
                    generation: 0,
                    attached: true,
                },
            );
            tracing::info!(session = id, timeout_ms = timeout.as_millis() as u64, "Session opened");
            return Ok(Attachment {
                session_id: id,
                events,
                generation: 0,
            });
        }

        let live = self.tree.is_live(session_id).map_err(internal)?;
        match sessions.get_mut(&session_id) {
            Some(link) if live => {
                link.generation += 1;
                link.attached = true;
                tracing::info!(session = session_id, generation = link.generation, "Session resumed");
                Ok(Attachment {
                    session_id,
                    events: link.events.clone(),
                    generation: link.generation,
                })
            }
            _ => {
                sessions.remove(&session_id);
                Err(Status::not_found(format!("session {} expired", session_id)))
            }
        }
    }

    /// Marks the session detached and schedules its expiry, unless a newer
    /// stream has resumed the session since `generation` attached.
    fn detach(&self, session_id: u64, generation: u64) {
        let timeout = {
            let Ok(mut sessions) = self.sessions.lock() else {
                return;
            };
            let Some(link) = sessions.get_mut(&session_id) else {
                return;
            };
            if link.generation != generation {
                tracing::debug!(session = session_id, generation, "Superseded session stream closed");
                return;
            }
            link.attached = false;
            link.timeout
        };
        tracing::debug!(session = session_id, generation, "Session stream closed");

        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expire = match service.sessions.lock() {
                Ok(mut sessions) => match sessions.get(&session_id) {
                    Some(link) if !link.attached && link.generation == generation => {
                        sessions.remove(&session_id);
                        true
                    }
                    _ => false,
                },
                Err(_) => false,
            };
            if expire {
                if let Err(e) = service.tree.expire_session(session_id) {
                    tracing::warn!(session = session_id, error = %e, "Failed to expire session");
                }
            }
        });
    }

    fn end(&self, session_id: u64) -> Result<(), Status> {
        self.sessions()?.remove(&session_id);
        self.tree.expire_session(session_id).map_err(internal)?;
        tracing::info!(session = session_id, "Session closed");
        Ok(())
    }
}

fn internal(err: CoordError) -> Status {
    Status::internal(err.to_string())
}

/// Splits a tree result into the error code carried in the response body
/// and the value. Errors with no wire code become a transport status.
fn split<T>(result: CoordResult<T>) -> Result<(proto::ErrorCode, Option<T>), Status> {
    match result {
        Ok(value) => Ok((proto::ErrorCode::Ok, Some(value))),
        Err(CoordError::ConnectionLoss) => Err(Status::unavailable("connection lost")),
        Err(e) => match error_to_code(&e) {
            Some(code) => Ok((code, None)),
            None => Err(internal(e)),
        },
    }
}

fn wire_stat(stat: Stat) -> proto::Stat {
    proto::Stat {
        version: stat.version,
        ephemeral_owner: stat.ephemeral_owner,
        num_children: stat.num_children,
    }
}

fn wire_version(version: i32) -> Option<i32> {
    (version >= 0).then_some(version)
}

fn wire_event(session_id: u64, event: &WatchedEvent) -> proto::SessionEvent {
    let kind = match event.kind {
        EventKind::NodeCreated => proto::EventKind::NodeCreated,
        EventKind::NodeDeleted => proto::EventKind::NodeDeleted,
        EventKind::NodeDataChanged => proto::EventKind::NodeDataChanged,
        EventKind::NodeChildrenChanged => proto::EventKind::NodeChildrenChanged,
    };
    proto::SessionEvent {
        session_id,
        kind: kind as i32,
        path: event.path.clone(),
    }
}

#[tonic::async_trait]
impl TreeService for TreeServiceImpl {
    type OpenSessionStream = EventStream;

    async fn open_session(
        &self,
        request: Request<proto::OpenSessionRequest>,
    ) -> Result<Response<Self::OpenSessionStream>, Status> {
        let req = request.into_inner();
        let Attachment {
            session_id,
            events,
            generation,
        } = self.attach(req.session_id, Duration::from_millis(req.timeout_ms))?;

        let (tx, rx) = mpsc::channel(64);
        let service = self.clone();
        tokio::spawn(async move {
            let opened = proto::SessionEvent {
                session_id,
                kind: proto::EventKind::SessionOpened as i32,
                path: String::new(),
            };
            if tx.send(Ok(opened)).await.is_ok() {
                // A previous stream for this session may still hold the receiver
                let guard = tokio::select! {
                    guard = events.lock_owned() => Some(guard),
                    _ = tx.closed() => None,
                };
                if let Some(mut events) = guard {
                    loop {
                        tokio::select! {
                            _ = tx.closed() => break,
                            event = events.recv() => match event {
                                Some(event) => {
                                    if tx.send(Ok(wire_event(session_id, &event))).await.is_err() {
                                        // Client disconnected
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                }
            }
            service.detach(session_id, generation);
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::OpenSessionStream))
    }

    async fn close_session(
        &self,
        request: Request<proto::CloseSessionRequest>,
    ) -> Result<Response<proto::CloseSessionResponse>, Status> {
        self.end(request.into_inner().session_id)?;
        Ok(Response::new(proto::CloseSessionResponse {}))
    }

    async fn create(
        &self,
        request: Request<proto::CreateRequest>,
    ) -> Result<Response<proto::CreateResponse>, Status> {
        let req = request.into_inner();
        let mode = local_mode(req.mode());
        let (code, path) = split(self.tree.create(req.session_id, &req.path, &req.data, mode))?;
        Ok(Response::new(proto::CreateResponse {
            error: code as i32,
            path: path.unwrap_or_default(),
        }))
    }

    async fn delete(
        &self,
        request: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::DeleteResponse>, Status> {
        let req = request.into_inner();
        let (code, _) = split(
            self.tree
                .delete(req.session_id, &req.path, wire_version(req.version)),
        )?;
        Ok(Response::new(proto::DeleteResponse { error: code as i32 }))
    }

    async fn exists(
        &self,
        request: Request<proto::ExistsRequest>,
    ) -> Result<Response<proto::ExistsResponse>, Status> {
        let req = request.into_inner();
        let watcher = self.watcher(req.session_id, req.watch)?;
        let (code, stat) = split(self.tree.exists(req.session_id, &req.path, watcher.as_ref()))?;
        Ok(Response::new(proto::ExistsResponse {
            error: code as i32,
            stat: stat.flatten().map(wire_stat),
        }))
    }

    async fn get_children(
        &self,
        request: Request<proto::GetChildrenRequest>,
    ) -> Result<Response<proto::GetChildrenResponse>, Status> {
        let req = request.into_inner();
        let watcher = self.watcher(req.session_id, req.watch)?;
        let (code, children) = split(self.tree.get_children(
            req.session_id,
            &req.path,
            watcher.as_ref(),
        ))?;
        Ok(Response::new(proto::GetChildrenResponse {
            error: code as i32,
            children: children.unwrap_or_default(),
        }))
    }

    async fn get_data(
        &self,
        request: Request<proto::GetDataRequest>,
    ) -> Result<Response<proto::GetDataResponse>, Status> {
        let req = request.into_inner();
        let watcher = self.watcher(req.session_id, req.watch)?;
        let (code, found) = split(self.tree.get_data(req.session_id, &req.path, watcher.as_ref()))?;
        let (data, stat) = match found {
            Some((data, stat)) => (data, Some(wire_stat(stat))),
            None => (Vec::new(), None),
        };
        Ok(Response::new(proto::GetDataResponse {
            error: code as i32,
            data,
            stat,
        }))
    }

    async fn set_data(
        &self,
        request: Request<proto::SetDataRequest>,
    ) -> Result<Response<proto::SetDataResponse>, Status> {
        let req = request.into_inner();
        let (code, stat) = split(self.tree.set_data(
            req.session_id,
            &req.path,
            &req.data,
            wire_version(req.version),
        ))?;
        Ok(Response::new(proto::SetDataResponse {
            error: code as i32,
            stat: stat.map(wire_stat),
        }))
    }
}
