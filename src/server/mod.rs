//! Development coordination server.
//!
//! Hosts a [`MemoryTree`] over gRPC so a manager and its workers running as
//! separate processes share one tree. This is not a replicated service.

mod service;

pub use service::TreeServiceImpl;

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::ServerConfig;
use crate::coord::memory::MemoryTree;
use crate::proto::tree_service_server::TreeServiceServer;

pub struct CoordServer {
    config: ServerConfig,
    tree: MemoryTree,
}

impl CoordServer {
    pub fn new(config: ServerConfig, tree: MemoryTree) -> Self {
        Self { config, tree }
    }

    fn service(&self) -> TreeServiceServer<TreeServiceImpl> {
        TreeServiceServer::new(TreeServiceImpl::new(
            self.tree.clone(),
            Duration::from_millis(self.config.max_session_timeout_ms),
        ))
    }

    /// Serves on the configured address until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.config.listen_addr, "Starting coordination server");

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.config.listen_addr, shutdown.cancelled_owned())
            .await
    }

    /// Serves on an already bound listener until `shutdown` is cancelled.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting coordination server");
        }

        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
    }
}
