/// Local filesystem cache of artifacts.
///
/// Original uploads are kept here until their task is DONE, so a
/// restarted task can re-register without asking the client to re-upload.
/// Finished results are cached under their registration txid so the
/// gateway can serve downloads without a WalletNode round trip.
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

#[derive(Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join("uploads").join(task_id.to_string())
    }

    fn result_path(&self, reg_ticket_txid: &str) -> PathBuf {
        self.root.join("results").join(reg_ticket_txid)
    }

    /// Store an original upload for a task. Returns the stored path.
    pub async fn store_original(
        &self,
        task_id: Uuid,
        file_name: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);
        fs::write(&path, data).await?;
        Ok(path)
    }

    /// Read back an original upload by its stored path.
    pub async fn read_original(&self, path: &Path) -> Result<Vec<u8>> {
        if !path.starts_with(&self.root) {
            return Err(GatewayError::Invariant(format!(
                "path {} is outside the cache root",
                path.display()
            )));
        }
        Ok(fs::read(path).await?)
    }

    /// Drop the upload directory of a finished task.
    pub async fn remove_original(&self, task_id: Uuid) -> Result<()> {
        let dir = self.task_dir(task_id);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Cache a finished result under its registration txid.
    pub async fn store_result(&self, reg_ticket_txid: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.result_path(reg_ticket_txid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(path)
    }

    /// Read a cached result, or None when it was never cached.
    pub async fn read_result(&self, reg_ticket_txid: &str) -> Result<Option<Vec<u8>>> {
        let path = self.result_path(reg_ticket_txid);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(fs::read(&path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_read_original() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path().to_path_buf());
        let task_id = Uuid::new_v4();

        let path = cache
            .store_original(task_id, "photo.png", b"pixels")
            .await
            .unwrap();
        assert_eq!(cache.read_original(&path).await.unwrap(), b"pixels");

        cache.remove_original(task_id).await.unwrap();
        assert!(cache.read_original(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_read_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path().to_path_buf());
        let err = cache
            .read_original(Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_result_cache_miss_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path().to_path_buf());
        assert!(cache.read_result("txid123").await.unwrap().is_none());

        cache.store_result("txid123", b"artifact").await.unwrap();
        assert_eq!(
            cache.read_result("txid123").await.unwrap().unwrap(),
            b"artifact"
        );
    }
}
