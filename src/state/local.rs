//! Local file-based snapshot storage backend.
//!
//! Snapshots are written to a uniquely named temporary file, synced, then
//! renamed over the previous one, so readers see either the old or the new
//! document. Saves and lock changes hold an exclusive OS lock on a guard
//! file, so engines in different processes cannot both commit from the same
//! revision. A lock file next to the snapshot guards a whole deployment.

use async_trait::async_trait;
use fd_lock::RwLock;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, Result, StateError};

use super::document::SnapshotDocument;
use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::{lock_lost, SnapshotStore};

/// Default state directory name.
const STATE_DIR: &str = ".converge";

/// Snapshot file name.
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Lock file name.
const LOCK_FILE: &str = "snapshot.lock";

/// File held under an exclusive OS lock while the store is written.
const GUARD_FILE: &str = "snapshot.guard";

const BACKEND: &str = "local";

/// Local file-based snapshot store.
#[derive(Debug)]
pub struct LocalSnapshotStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the snapshot file.
    snapshot_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Path to the write guard file.
    guard_path: PathBuf,
    /// Queues writers of this instance before they take the OS lock.
    write_queue: Mutex<()>,
}

impl LocalSnapshotStore {
    /// Creates a new store under `.converge` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| EngineError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let snapshot_path = base_dir.join(SNAPSHOT_FILE);
        Self::from_parts(base_dir, snapshot_path)
    }

    /// Creates a new store from a custom snapshot file path.
    #[must_use]
    pub fn with_snapshot_path(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let base_dir = snapshot_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_parts(base_dir, snapshot_path)
    }

    fn from_parts(base_dir: PathBuf, snapshot_path: PathBuf) -> Self {
        Self {
            lock_path: base_dir.join(LOCK_FILE),
            guard_path: base_dir.join(GUARD_FILE),
            base_dir,
            snapshot_path,
            write_queue: Mutex::new(()),
        }
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::backend(BACKEND, format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Runs `f` on a blocking thread while holding the exclusive lock on
    /// the guard file.
    async fn guarded<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let _queued = self.write_queue.lock().await;
        self.ensure_dir().await?;
        let guard_path = self.guard_path.clone();

        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&guard_path)
                .map_err(|e| StateError::backend(BACKEND, format!("Failed to open guard file: {e}")))?;
            let mut guard = RwLock::new(file);
            let _held = guard
                .write()
                .map_err(|e| StateError::backend(BACKEND, format!("Failed to lock guard file: {e}")))?;
            f()
        })
        .await
        .map_err(|e| EngineError::internal(format!("Snapshot store task failed: {e}")))?
    }
}

/// Writes `content` to `path` through a synced temporary file in the same
/// directory.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Revision of the stored snapshot, 0 if there is none.
fn stored_revision(path: &Path) -> Result<u64> {
    match std::fs::read(path) {
        Ok(content) => Ok(SnapshotDocument::from_bytes(&content)?.revision()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(StateError::corrupted(format!("Failed to read snapshot file: {e}")).into()),
    }
}

/// Reads the lock file if it exists.
fn read_lock_file(path: &Path) -> Result<Option<LockInfo>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into()),
    };

    let lock_info: LockInfo = serde_json::from_str(&content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

    Ok(Some(lock_info))
}

/// Deletes the lock file.
fn delete_lock_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::LockFailed {
            message: format!("Failed to delete lock file: {e}"),
        }
        .into()),
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn load_document(&self) -> Result<Option<SnapshotDocument>> {
        if !self.snapshot_path.exists() {
            debug!("Snapshot file does not exist: {}", self.snapshot_path.display());
            return Ok(None);
        }

        debug!("Reading snapshot from: {}", self.snapshot_path.display());

        let content = fs::read(&self.snapshot_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read snapshot file: {e}")))?;

        Ok(Some(SnapshotDocument::from_bytes(&content)?))
    }

    async fn save_document(&self, document: &SnapshotDocument, base_revision: u64) -> Result<()> {
        let content = document.to_bytes()?;
        let snapshot_path = self.snapshot_path.clone();

        info!(
            "Saving snapshot revision {} to: {}",
            document.revision(),
            self.snapshot_path.display()
        );

        self.guarded(move || {
            let stored = stored_revision(&snapshot_path)?;
            if stored != base_revision {
                return Err(StateError::Conflict {
                    expected: base_revision,
                    found: stored,
                }
                .into());
            }
            write_atomic(&snapshot_path, &content).map_err(|e| {
                StateError::backend(BACKEND, format!("Failed to write snapshot file: {e}"))
            })?;
            Ok(())
        })
        .await?;

        debug!("Snapshot saved successfully");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let snapshot_path = self.snapshot_path.clone();
        let lock_path = self.lock_path.clone();

        self.guarded(move || {
            if snapshot_path.exists() {
                info!("Deleting snapshot file: {}", snapshot_path.display());
                std::fs::remove_file(&snapshot_path).map_err(|e| {
                    StateError::backend(BACKEND, format!("Failed to delete snapshot file: {e}"))
                })?;
            }
            delete_lock_file(&lock_path)
        })
        .await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_path = self.lock_path.clone();
        let lock_info = LockInfo::new(holder);
        let written = lock_info.clone();

        self.guarded(move || {
            if let Some(existing) = read_lock_file(&lock_path)? {
                if !existing.is_expired() {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder.clone(),
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                debug!("Expired lock found, taking over");
            }

            let content = serde_json::to_vec_pretty(&written)
                .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
            write_atomic(&lock_path, &content).map_err(|e| StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })?;
            Ok(())
        })
        .await?;

        info!(
            "Acquired snapshot lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let lock_path = self.lock_path.clone();
        let lock = lock.clone();

        let refreshed = self
            .guarded(move || {
                let mut held = match read_lock_file(&lock_path)? {
                    Some(held) if held.lock_id == lock.lock_id => held,
                    _ => return Err(lock_lost(&lock).into()),
                };
                held.refresh();
                let content = serde_json::to_vec_pretty(&held)
                    .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
                write_atomic(&lock_path, &content).map_err(|e| StateError::LockFailed {
                    message: format!("Failed to write lock file: {e}"),
                })?;
                Ok(held)
            })
            .await?;

        debug!("Refreshed snapshot lock: {}", refreshed.lock_id);
        Ok(refreshed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let lock_path = self.lock_path.clone();
        let lock_id = lock_id.to_string();

        self.guarded(move || {
            if let Some(existing) = read_lock_file(&lock_path)? {
                if existing.lock_id == lock_id {
                    delete_lock_file(&lock_path)?;
                    info!("Released snapshot lock: {lock_id}");
                } else {
                    debug!(
                        "Lock ID mismatch: expected {lock_id}, found {}",
                        existing.lock_id
                    );
                }
            }
            Ok(())
        })
        .await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || read_lock_file(&lock_path))
            .await
            .map_err(|e| EngineError::internal(format!("Snapshot store task failed: {e}")))?
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn location(&self) -> String {
        self.snapshot_path.display().to_string()
    }
}
