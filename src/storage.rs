//! Durable blob storage for Raft state and snapshots.
//!
//! The store treats both blobs as opaque bytes. Encoding lives with
//! [`crate::raft::RaftState`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt persisted data: {0}")]
    Corrupt(String),
}

#[async_trait::async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Atomically replaces the state blob.
    async fn save_state(&self, state: Bytes) -> Result<(), StorageError>;

    /// Atomically replaces the state blob and the snapshot blob together.
    async fn save_state_and_snapshot(
        &self,
        state: Bytes,
        snapshot: Bytes,
    ) -> Result<(), StorageError>;

    async fn load_state(&self) -> Result<Option<Bytes>, StorageError>;

    async fn load_snapshot(&self) -> Result<Option<Bytes>, StorageError>;
}

#[derive(Debug, Default, Clone)]
struct Blobs {
    state: Option<Bytes>,
    snapshot: Option<Bytes>,
}

/// In-memory store. Clones share the same blobs.
#[derive(Clone, Default)]
pub struct MemStorage {
    blobs: Arc<Mutex<Blobs>>,
}

impl std::fmt::Debug for MemStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStorage").finish()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detached copy of the current contents, used to model a crash: the
    /// old instance may keep receiving writes from a dying node while the
    /// restarted node only sees what was durable at the crash point.
    pub async fn duplicate(&self) -> Self {
        let blobs = self.blobs.lock().await.clone();
        Self {
            blobs: Arc::new(Mutex::new(blobs)),
        }
    }
}

#[async_trait::async_trait]
impl Storage for MemStorage {
    async fn save_state(&self, state: Bytes) -> Result<(), StorageError> {
        self.blobs.lock().await.state = Some(state);
        Ok(())
    }

    async fn save_state_and_snapshot(
        &self,
        state: Bytes,
        snapshot: Bytes,
    ) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().await;
        blobs.state = Some(state);
        blobs.snapshot = Some(snapshot);
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<Bytes>, StorageError> {
        Ok(self.blobs.lock().await.state.clone())
    }

    async fn load_snapshot(&self) -> Result<Option<Bytes>, StorageError> {
        Ok(self.blobs.lock().await.snapshot.clone())
    }
}

/// Header stored in front of the state blob naming its snapshot file.
#[derive(Serialize, Deserialize)]
struct StateFile {
    snapshot_generation: Option<u64>,
    state: Bytes,
}

/// File-backed store.
///
/// Layout inside `dir`:
/// - `state.bin`: the state blob framed with the snapshot generation it
///   belongs to
/// - `snapshot-<generation>.bin`: snapshot blobs
///
/// Every file is written to a temporary name, fsynced and renamed into
/// place. A snapshot is always written before the state file that points
/// at it.
pub struct FileStorage {
    dir: PathBuf,
    generation: Mutex<Option<u64>>,
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage").field("dir", &self.dir).finish()
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileStorage {
    /// Opens (and creates if needed) a storage directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        let storage = Self {
            dir,
            generation: Mutex::new(None),
        };
        let generation = storage
            .read_state_file()
            .await?
            .and_then(|f| f.snapshot_generation);
        *storage.generation.lock().await = generation;
        Ok(storage)
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.bin")
    }

    fn snapshot_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{generation}.bin"))
    }

    async fn write_atomic(
        &self,
        path: &Path,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        let mut file =
            tokio::fs::File::create(&tmp).await.map_err(io_err(&tmp))?;
        file.write_all(data).await.map_err(io_err(&tmp))?;
        file.sync_all().await.map_err(io_err(&tmp))?;
        drop(file);
        tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
        Ok(())
    }

    async fn read_optional(
        &self,
        path: &Path,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(path)(e)),
        }
    }

    async fn read_state_file(&self) -> Result<Option<StateFile>, StorageError> {
        let Some(raw) = self.read_optional(&self.state_path()).await? else {
            return Ok(None);
        };
        bincode::deserialize(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(format!("state file: {e}")))
    }

    async fn write_state_file(
        &self,
        snapshot_generation: Option<u64>,
        state: Bytes,
    ) -> Result<(), StorageError> {
        let file = StateFile {
            snapshot_generation,
            state,
        };
        let raw = bincode::serialize(&file)
            .map_err(|e| StorageError::Corrupt(format!("state file: {e}")))?;
        self.write_atomic(&self.state_path(), &raw).await
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    async fn save_state(&self, state: Bytes) -> Result<(), StorageError> {
        let generation = self.generation.lock().await;
        self.write_state_file(*generation, state).await
    }

    async fn save_state_and_snapshot(
        &self,
        state: Bytes,
        snapshot: Bytes,
    ) -> Result<(), StorageError> {
        let mut generation = self.generation.lock().await;
        let previous = *generation;
        let next = previous.map_or(1, |g| g + 1);

        self.write_atomic(&self.snapshot_path(next), &snapshot)
            .await?;
        self.write_state_file(Some(next), state).await?;
        *generation = Some(next);

        if let Some(old) = previous {
            let old_path = self.snapshot_path(old);
            if let Err(e) = tokio::fs::remove_file(&old_path).await {
                tracing::warn!(path = ?old_path, error = ?e, "Failed to remove superseded snapshot");
            }
        }
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<Bytes>, StorageError> {
        Ok(self.read_state_file().await?.map(|f| f.state))
    }

    async fn load_snapshot(&self) -> Result<Option<Bytes>, StorageError> {
        let Some(generation) = *self.generation.lock().await else {
            return Ok(None);
        };
        let path = self.snapshot_path(generation);
        match self.read_optional(&path).await? {
            Some(data) => Ok(Some(Bytes::from(data))),
            None => Err(StorageError::Corrupt(format!(
                "state references missing snapshot {path:?}"
            ))),
        }
    }
}

/// [`MemStorage`] whose writes can be made to fail on demand.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingStorage {
    inner: MemStorage,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStorage {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Shares the underlying blobs, for restoring from what was written.
    pub(crate) fn mem(&self) -> MemStorage {
        self.inner.clone()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::Io {
                path: PathBuf::from("<failing>"),
                source: std::io::Error::other("write refused"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl Storage for FailingStorage {
    async fn save_state(&self, state: Bytes) -> Result<(), StorageError> {
        self.check()?;
        self.inner.save_state(state).await
    }

    async fn save_state_and_snapshot(
        &self,
        state: Bytes,
        snapshot: Bytes,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.save_state_and_snapshot(state, snapshot).await
    }

    async fn load_state(&self) -> Result<Option<Bytes>, StorageError> {
        self.inner.load_state().await
    }

    async fn load_snapshot(&self) -> Result<Option<Bytes>, StorageError> {
        self.inner.load_snapshot().await
    }
}
