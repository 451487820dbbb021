use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::File;

/// Per-job result blobs on the shared filesystem.
///
/// A blob is written (moved in) by the worker that ran the job and deleted by
/// the combiner once streamed, or by cancellation cleanup.
#[derive(Debug, Clone)]
pub struct SharedStorage {
    root: PathBuf,
}

impl SharedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("sharddist-{}.tmp", id))
    }

    /// Opens a job's blob; `None` if the job produced no output.
    pub async fn open(&self, id: &str) -> std::io::Result<Option<File>> {
        match File::open(self.blob_path(id)).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes a job's blob. Returns false if there was none.
    pub async fn delete(&self, id: &str) -> std::io::Result<bool> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Moves a local output file in as the job's blob.
    ///
    /// Returns false if `local` does not exist. Falls back to copy and
    /// remove when a rename is not possible, e.g. across devices.
    pub async fn move_from_local(&self, local: &Path, id: &str) -> std::io::Result<bool> {
        let target = self.blob_path(id);
        match tokio::fs::rename(local, &target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if tokio::fs::try_exists(local).await? {
                    Err(e)
                } else {
                    Ok(false)
                }
            }
            Err(e) => {
                tracing::debug!(job_id = %id, error = %e, "Rename failed, copying output");
                tokio::fs::copy(local, &target).await?;
                tokio::fs::remove_file(local).await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn blob_lifecycle() {
        let shared = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let storage = SharedStorage::new(shared.path());

        assert_eq!(
            storage.blob_path("0000000001"),
            shared.path().join("sharddist-0000000001.tmp")
        );
        assert!(storage.open("0000000001").await.unwrap().is_none());

        let out = local.path().join("out");
        tokio::fs::write(&out, b"flows").await.unwrap();
        assert!(storage.move_from_local(&out, "0000000001").await.unwrap());
        assert!(!out.exists());

        let mut buf = Vec::new();
        let mut file = storage.open("0000000001").await.unwrap().unwrap();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"flows");

        assert!(storage.delete("0000000001").await.unwrap());
        assert!(!storage.delete("0000000001").await.unwrap());
    }

    #[tokio::test]
    async fn missing_local_output_is_not_an_error() {
        let shared = tempfile::tempdir().unwrap();
        let storage = SharedStorage::new(shared.path());
        let moved = storage
            .move_from_local(&shared.path().join("never-written"), "7")
            .await
            .unwrap();
        assert!(!moved);
    }
}
