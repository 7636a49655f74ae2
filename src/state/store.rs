//! Snapshot store trait definition.
//!
//! Backends persist [`SnapshotDocument`]s and enforce optimistic
//! concurrency: a save names the revision it was based on and fails with
//! [`StateError::Conflict`] if another writer got there first. Readers must
//! never observe a partially written document.

use async_trait::async_trait;
use tracing::{debug, info};

use super::document::SnapshotDocument;
use super::lock::LockInfo;
use super::types::Snapshot;
use crate::error::{Result, StateError};

/// The error returned when a lock being refreshed was lost.
pub(crate) fn lock_lost(lock: &LockInfo) -> StateError {
    StateError::LockFailed {
        message: format!("lock {} is no longer held by {}", lock.lock_id, lock.holder),
    }
}
use crate::secrets::{Decrypter, Encrypter};

/// Trait for snapshot storage backends.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Loads the stored document, or `None` if the target was never written.
    async fn load_document(&self) -> Result<Option<SnapshotDocument>>;

    /// Atomically replaces the stored document.
    ///
    /// `base_revision` is the revision the caller read (0 if none). The
    /// write must fail with [`StateError::Conflict`] if the stored revision
    /// differs.
    async fn save_document(&self, document: &SnapshotDocument, base_revision: u64) -> Result<()>;

    /// Deletes the stored document and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if a document exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the target's lock.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends a held lock's expiry and returns the refreshed lock.
    ///
    /// Fails with [`StateError::LockFailed`] if the stored lock is no
    /// longer `lock`.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases a lock previously acquired.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the target is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Describes where the document lives, for messages.
    fn location(&self) -> String;

    /// Loads and decodes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if nothing was ever saved, or any
    /// integrity, checksum or decryption failure.
    async fn load(&self, decrypter: &dyn Decrypter) -> Result<Snapshot> {
        let document = self.load_document().await?.ok_or_else(|| StateError::NotFound {
            location: self.location(),
        })?;
        let snapshot = document.decode(decrypter).await?;
        snapshot.verify_integrity()?;
        info!(
            "Loaded snapshot revision {} from {}",
            snapshot.revision,
            self.location()
        );
        Ok(snapshot)
    }

    /// Loads the snapshot, or an empty one if nothing was ever saved.
    async fn load_or_empty(&self, decrypter: &dyn Decrypter) -> Result<Snapshot> {
        match self.load(decrypter).await {
            Ok(snapshot) => Ok(snapshot),
            Err(crate::error::EngineError::State(StateError::NotFound { .. })) => {
                debug!("No snapshot at {}, starting empty", self.location());
                Ok(Snapshot::empty())
            }
            Err(e) => Err(e),
        }
    }

    /// Encodes and saves a snapshot as `base_revision + 1`.
    ///
    /// Returns the new revision.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] if the stored revision is not
    /// `base_revision`, or any integrity, encryption or backend failure.
    async fn save(&self, snapshot: &Snapshot, base_revision: u64, encrypter: &dyn Encrypter) -> Result<u64> {
        snapshot.verify_integrity()?;
        let revision = base_revision + 1;
        let document = SnapshotDocument::encode(snapshot, revision, encrypter).await?;
        self.save_document(&document, base_revision).await?;
        debug!("Saved snapshot revision {} to {}", revision, self.location());
        Ok(revision)
    }
}

#[async_trait]
impl SnapshotStore for Box<dyn SnapshotStore> {
    async fn load_document(&self) -> Result<Option<SnapshotDocument>> {
        (**self).load_document().await
    }

    async fn save_document(&self, document: &SnapshotDocument, base_revision: u64) -> Result<()> {
        (**self).save_document(document, base_revision).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        (**self).refresh_lock(lock).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}
