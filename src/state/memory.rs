//! In-memory snapshot store.
//!
//! Keeps every saved document so tests can inspect the sequence of
//! checkpoints a deployment wrote. A save budget simulates a process that
//! dies after a given number of checkpoints.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StateError};

use super::document::SnapshotDocument;
use super::lock::LockInfo;
use super::store::{lock_lost, SnapshotStore};

const BACKEND: &str = "memory";

#[derive(Debug, Default)]
struct Inner {
    current: Option<SnapshotDocument>,
    history: Vec<SnapshotDocument>,
    lock: Option<LockInfo>,
    remaining_saves: Option<usize>,
}

/// In-memory snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Inner>,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding an existing document.
    #[must_use]
    pub fn with_document(document: SnapshotDocument) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: Some(document),
                ..Inner::default()
            }),
        }
    }

    /// Makes every save after the first `saves` fail with a backend error.
    #[must_use]
    pub fn failing_after(self, saves: usize) -> Self {
        self.lock_inner().remaining_saves = Some(saves);
        self
    }

    /// Returns every document saved through this store, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SnapshotDocument> {
        self.lock_inner().history.clone()
    }

    /// Returns the number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.lock_inner().history.len()
    }

    /// Returns the current document.
    #[must_use]
    pub fn current(&self) -> Option<SnapshotDocument> {
        self.lock_inner().current.clone()
    }

    /// Replaces the current document, bypassing revision checks.
    ///
    /// Simulates another writer.
    pub fn overwrite(&self, document: SnapshotDocument) {
        self.lock_inner().current = Some(document);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-save.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_document(&self) -> Result<Option<SnapshotDocument>> {
        Ok(self.lock_inner().current.clone())
    }

    async fn save_document(&self, document: &SnapshotDocument, base_revision: u64) -> Result<()> {
        let mut inner = self.lock_inner();

        if let Some(remaining) = inner.remaining_saves.as_mut() {
            if *remaining == 0 {
                return Err(StateError::backend(BACKEND, "simulated crash: save budget exhausted").into());
            }
            *remaining -= 1;
        }

        let stored = inner.current.as_ref().map_or(0, SnapshotDocument::revision);
        if stored != base_revision {
            return Err(StateError::Conflict {
                expected: base_revision,
                found: stored,
            }
            .into());
        }

        debug!("Memory store saving revision {}", document.revision());
        inner.current = Some(document.clone());
        inner.history.push(document.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.current = None;
        inner.lock = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.lock_inner().current.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut inner = self.lock_inner();
        if let Some(existing) = &inner.lock {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
        }
        let lock = LockInfo::new(holder);
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut inner = self.lock_inner();
        match inner.lock.as_mut() {
            Some(held) if held.lock_id == lock.lock_id => {
                held.refresh();
                Ok(held.clone())
            }
            _ => Err(lock_lost(lock).into()),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock_inner().lock.clone())
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::secrets::NoSecretsCrypter;
    use crate::state::Snapshot;

    #[tokio::test]
    async fn test_history_records_each_save() {
        let store = MemorySnapshotStore::new();
        let r1 = store.save(&Snapshot::empty(), 0, &NoSecretsCrypter).await.unwrap();
        let r2 = store.save(&Snapshot::empty(), r1, &NoSecretsCrypter).await.unwrap();

        assert_eq!(r2, 2);
        let revisions: Vec<u64> = store.history().iter().map(SnapshotDocument::revision).collect();
        assert_eq!(revisions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_save_budget() {
        let store = MemorySnapshotStore::new().failing_after(1);
        store.save(&Snapshot::empty(), 0, &NoSecretsCrypter).await.unwrap();
        let err = store.save(&Snapshot::empty(), 1, &NoSecretsCrypter).await.unwrap_err();
        assert!(matches!(err, EngineError::State(StateError::Backend { .. })));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflict() {
        let store = MemorySnapshotStore::new();
        store.save(&Snapshot::empty(), 0, &NoSecretsCrypter).await.unwrap();

        let other = SnapshotDocument::encode(&Snapshot::empty(), 5, &NoSecretsCrypter)
            .await
            .unwrap();
        store.overwrite(other);

        let err = store.save(&Snapshot::empty(), 1, &NoSecretsCrypter).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::Conflict { expected: 1, found: 5 })
        ));
    }

    #[tokio::test]
    async fn test_lock() {
        let store = MemorySnapshotStore::new();
        let lock = store.acquire_lock("a").await.unwrap();
        assert!(store.acquire_lock("b").await.is_err());
        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_requires_the_held_lock() {
        let store = MemorySnapshotStore::new();
        let lock = store.acquire_lock("a").await.unwrap();
        let refreshed = store.refresh_lock(&lock).await.unwrap();
        assert_eq!(refreshed.lock_id, lock.lock_id);
        assert!(refreshed.expires_at >= lock.expires_at);

        let foreign = LockInfo::new("b");
        let err = store.refresh_lock(&foreign).await.unwrap_err();
        assert!(matches!(err, EngineError::State(StateError::LockFailed { .. })));

        store.release_lock(&lock.lock_id).await.unwrap();
        let err = store.refresh_lock(&lock).await.unwrap_err();
        assert!(matches!(err, EngineError::State(StateError::LockFailed { .. })));
    }
}
