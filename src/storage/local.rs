//! Local filesystem blob and snapshot storage.
//!
//! Used for development and by the CLI. Production deployments should use
//! the S3 backend.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── jobs.json                       # Document store snapshot
//! ├── jobs.json.lock                  # Held while the snapshot is swapped
//! └── graphs/
//!     └── {owner}/
//!         ├── {root}                  # GML file
//!         └── {root}.disposition      # Content-Disposition header value
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::{BlobStore, SnapshotBackend};
use crate::utils::sha256_hex;

const DISPOSITION_SUFFIX: &str = "disposition";

/// `path` with `suffix` appended to its file name.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write bytes atomically (write to temp, then rename).
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = with_suffix(path, ".tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Local filesystem blob backend.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root_dir: PathBuf,
}

impl LocalBlobStore {
    /// Create a new LocalBlobStore rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn disposition_path(&self, key: &str) -> PathBuf {
        self.path(&format!("{}.{}", key, DISPOSITION_SUFFIX))
    }

    /// Stored Content-Disposition of a blob, if any.
    pub async fn content_disposition(&self, key: &str) -> Result<Option<String>> {
        Ok(read_optional(&self.disposition_path(key))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::Io(e)),
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn write(&self, key: &str, bytes: &[u8], content_disposition: &str) -> Result<()> {
        let path = self.path(key);
        write_atomic(&path, bytes).await?;
        write_atomic(&self.disposition_path(key), content_disposition.as_bytes()).await?;
        log::info!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.path(key)).await
    }
}

/// Exclusive advisory lock on a file, held until dropped. Closing the
/// handle releases the lock.
struct FileLock {
    _file: std::fs::File,
}

impl FileLock {
    async fn exclusive(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || -> std::io::Result<Self> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(Self { _file: file })
        })
        .await
        .map_err(|e| AppError::persistence(format!("lock task failed: {}", e)))?
        .map_err(AppError::Io)
    }
}

/// Store snapshot in a local JSON file, shared by every process on the
/// host that opens the same path.
///
/// The revision is the SHA-256 of the file contents. A swap takes an
/// exclusive lock on `<path>.lock`, re-reads the file and only replaces it
/// if the revision is still the expected one.
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    path: PathBuf,
}

impl LocalSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotBackend for LocalSnapshot {
    async fn load(&self) -> Result<Option<(Vec<u8>, String)>> {
        Ok(read_optional(&self.path).await?.map(|bytes| {
            let revision = sha256_hex(&bytes);
            (bytes, revision)
        }))
    }

    async fn swap(&self, bytes: &[u8], expected: Option<&str>) -> Result<bool> {
        let _lock = FileLock::exclusive(with_suffix(&self.path, ".lock")).await?;
        let current = self.load().await?.map(|(_, revision)| revision);
        if current.as_deref() != expected {
            log::debug!("Snapshot {} moved on, not swapping", self.path.display());
            return Ok(false);
        }
        write_atomic(&self.path, bytes).await?;
        Ok(true)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalBlobStore::new(tmp.path());

        storage
            .write("graphs/u1/42", b"graph [ ]", "Attachment; filename=bob.gml")
            .await
            .unwrap();
        let data = storage.read("graphs/u1/42").await.unwrap();
        assert_eq!(data, Some(b"graph [ ]".to_vec()));
        assert_eq!(
            storage.content_disposition("graphs/u1/42").await.unwrap().as_deref(),
            Some("Attachment; filename=bob.gml")
        );
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalBlobStore::new(tmp.path());

        assert!(storage.read("graphs/nope").await.unwrap().is_none());
        assert!(storage.content_disposition("graphs/nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalBlobStore::new(tmp.path());

        storage.write("g/a", b"one", "x").await.unwrap();
        storage.write("g/a", b"two", "x").await.unwrap();

        assert_eq!(storage.read("g/a").await.unwrap(), Some(b"two".to_vec()));
        assert!(!tmp.path().join("g/a.tmp").exists());
        assert!(!tmp.path().join("g/a.disposition.tmp").exists());
    }

    #[tokio::test]
    async fn test_snapshot_swap_is_compare_and_set() {
        let tmp = TempDir::new().unwrap();
        let snapshot = LocalSnapshot::new(tmp.path().join("state/jobs.json"));
        assert!(snapshot.load().await.unwrap().is_none());

        assert!(snapshot.swap(b"one", None).await.unwrap());
        let (bytes, first) = snapshot.load().await.unwrap().unwrap();
        assert_eq!(bytes, b"one");

        // a second creator loses
        assert!(!snapshot.swap(b"other", None).await.unwrap());

        assert!(snapshot.swap(b"two", Some(&first)).await.unwrap());
        // a writer still holding the first revision loses
        assert!(!snapshot.swap(b"stale", Some(&first)).await.unwrap());
        assert_eq!(snapshot.load().await.unwrap().unwrap().0, b"two");
    }
}
