use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{Coordination, CreateMode, Stat, Watcher};
use crate::error::{CoordError, CoordResult};

/// Retries every operation on connection loss.
///
/// Any other error, session expiry included, is returned unchanged. Note that
/// a lost reply can hide an applied write: a retried `create` may then fail
/// with `NodeExists`, or for sequential nodes leave an orphan behind.
#[derive(Debug, Clone)]
pub struct Retrying<C> {
    inner: C,
    backoff: Duration,
}

impl<C: Coordination> Retrying<C> {
    pub fn new(inner: C, backoff: Duration) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, path: &str, mut f: F) -> CoordResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = CoordResult<T>> + Send,
        T: Send,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Err(CoordError::ConnectionLoss) => {
                    attempt += 1;
                    tracing::debug!(op, path, attempt, "Connection lost, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<C: Coordination> Coordination for Retrying<C> {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        self.retry("create", path, || self.inner.create(path, data, mode))
            .await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordResult<()> {
        self.retry("delete", path, || self.inner.delete(path, version))
            .await
    }

    async fn exists(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Option<Stat>> {
        self.retry("exists", path, || self.inner.exists(path, watch))
            .await
    }

    async fn get_children(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<Vec<String>> {
        self.retry("get_children", path, || self.inner.get_children(path, watch))
            .await
    }

    async fn get_data(&self, path: &str, watch: Option<&Watcher>) -> CoordResult<(Vec<u8>, Stat)> {
        self.retry("get_data", path, || self.inner.get_data(path, watch))
            .await
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> CoordResult<Stat> {
        self.retry("set_data", path, || self.inner.set_data(path, data, version))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::memory::{Fault, MemoryTree};

    fn retrying(tree: &MemoryTree) -> Retrying<crate::coord::MemorySession> {
        Retrying::new(tree.session().unwrap(), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn retries_until_connection_returns() {
        let tree = MemoryTree::new();
        let client = retrying(&tree);
        let id = client.session_id();
        tree.fail_next(id, Fault::LoseBefore).unwrap();
        tree.fail_next(id, Fault::LoseBefore).unwrap();
        tree.fail_next(id, Fault::LoseBefore).unwrap();

        let path = client.create("/a", b"x", CreateMode::Persistent).await.unwrap();
        assert_eq!(path, "/a");
        let (data, _) = client.get_data("/a", None).await.unwrap();
        assert_eq!(data, b"x");
    }

    #[tokio::test]
    async fn logical_errors_pass_through() {
        let tree = MemoryTree::new();
        let client = retrying(&tree);

        let err = client.delete("/missing", None).await.unwrap_err();
        assert_eq!(err, CoordError::NoNode("/missing".into()));

        client.create("/v", b"", CreateMode::Persistent).await.unwrap();
        let err = client.set_data("/v", b"", Some(3)).await.unwrap_err();
        assert_eq!(err, CoordError::BadVersion("/v".into()));
    }

    #[tokio::test]
    async fn lost_reply_surfaces_as_node_exists() {
        let tree = MemoryTree::new();
        let client = retrying(&tree);
        tree.fail_next(client.session_id(), Fault::LoseAfter).unwrap();

        let err = client.create("/once", b"", CreateMode::Persistent).await.unwrap_err();
        assert_eq!(err, CoordError::NodeExists("/once".into()));
    }

    #[tokio::test]
    async fn session_expiry_is_not_retried() {
        let tree = MemoryTree::new();
        let client = retrying(&tree);
        let id = client.session_id();
        tree.expire_session(id).unwrap();

        let err = client.exists("/", None).await.unwrap_err();
        assert_eq!(err, CoordError::SessionExpired(id));
    }
}
