//! S3-based snapshot storage backend.
//!
//! Snapshots are single objects. Optimistic concurrency uses S3 conditional
//! writes: the first save requires that no object exists (`If-None-Match`),
//! later saves require the `ETag` that was read (`If-Match`).

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::document::SnapshotDocument;
use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::{lock_lost, SnapshotStore};

/// Snapshot key suffix.
const SNAPSHOT_KEY: &str = "snapshot.json";

/// Lock key suffix.
const LOCK_KEY: &str = "snapshot.lock";

const BACKEND: &str = "s3";

/// An object body together with its entity tag.
struct StoredObject {
    content: Vec<u8>,
    etag: Option<String>,
}

/// S3-based snapshot store.
#[derive(Debug)]
pub struct S3SnapshotStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

fn is_precondition_failure<E: ProvideErrorMetadata>(err: &E) -> bool {
    matches!(
        err.code(),
        Some("PreconditionFailed" | "ConditionalRequestConflict")
    )
}

impl S3SnapshotStore {
    /// Creates a new S3 snapshot store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 snapshot store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object and its entity tag.
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::backend(BACKEND, format!("Failed to read S3 object: {e}"))
                })?;

                Ok(Some(StoredObject {
                    content: bytes.to_vec(),
                    etag,
                }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(BACKEND, format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object unconditionally.
    async fn put_object(&self, key: &str, content: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Puts an object only if the stored version matches `etag`, or only
    /// if nothing is stored when `etag` is `None`.
    ///
    /// Returns false if the precondition failed.
    async fn put_object_if(&self, key: &str, content: Vec<u8>, etag: Option<&str>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type("application/json");

        let request = match etag {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) if is_precondition_failure(&sdk_err) => Ok(false),
            Err(sdk_err) => {
                Err(StateError::backend(BACKEND, format!("S3 put error: {sdk_err}")).into())
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::backend(BACKEND, format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    async fn stored_revision(&self, key: &str) -> Result<u64> {
        match self.get_object(key).await? {
            Some(object) => Ok(SnapshotDocument::from_bytes(&object.content)?.revision()),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    async fn load_document(&self) -> Result<Option<SnapshotDocument>> {
        let key = self.key(SNAPSHOT_KEY);
        debug!("Loading snapshot from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(object) => Ok(Some(SnapshotDocument::from_bytes(&object.content)?)),
            None => {
                debug!("No snapshot found in S3");
                Ok(None)
            }
        }
    }

    async fn save_document(&self, document: &SnapshotDocument, base_revision: u64) -> Result<()> {
        let key = self.key(SNAPSHOT_KEY);

        let current = self.get_object(&key).await?;
        let (stored, etag) = match &current {
            Some(object) => (
                SnapshotDocument::from_bytes(&object.content)?.revision(),
                object.etag.as_deref(),
            ),
            None => (0, None),
        };

        if stored != base_revision {
            return Err(StateError::Conflict {
                expected: base_revision,
                found: stored,
            }
            .into());
        }

        info!(
            "Saving snapshot revision {} to s3://{}/{key}",
            document.revision(),
            self.bucket
        );

        if current.is_some() && etag.is_none() {
            warn!("S3 returned no ETag; writing without a precondition");
            return self.put_object(&key, document.to_bytes()?).await;
        }

        if !self.put_object_if(&key, document.to_bytes()?, etag).await? {
            let found = self.stored_revision(&key).await?;
            return Err(StateError::Conflict {
                expected: base_revision,
                found,
            }
            .into());
        }

        debug!("Snapshot saved successfully to S3");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let snapshot_key = self.key(SNAPSHOT_KEY);
        let lock_key = self.key(LOCK_KEY);

        info!("Deleting snapshot from s3://{}/{snapshot_key}", self.bucket);

        self.delete_object(&snapshot_key).await?;
        self.delete_object(&lock_key).await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(SNAPSHOT_KEY);
        self.object_exists(&key).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let existing = self.get_object(&key).await?;
        if let Some(object) = &existing {
            let lock: LockInfo = serde_json::from_slice(&object.content)
                .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;

            if !lock.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: lock.holder.clone(),
                    since: lock.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(holder);
        let content = serde_json::to_vec_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let etag = existing.as_ref().and_then(|o| o.etag.as_deref());
        if !self.put_object_if(&key, content, etag).await? {
            return Err(StateError::LockFailed {
                message: "another engine took the lock concurrently".to_string(),
            }
            .into());
        }

        info!(
            "Acquired snapshot lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let Some(object) = self.get_object(&key).await? else {
            return Err(lock_lost(lock).into());
        };
        let mut held: LockInfo = serde_json::from_slice(&object.content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        if held.lock_id != lock.lock_id {
            return Err(lock_lost(lock).into());
        }

        held.refresh();
        let content = serde_json::to_vec_pretty(&held)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        if !self.put_object_if(&key, content, object.etag.as_deref()).await? {
            return Err(lock_lost(lock).into());
        }

        debug!("Refreshed snapshot lock: {}", held.lock_id);
        Ok(held)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        if let Some(lock) = self.get_lock_info().await? {
            if lock.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released snapshot lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    lock.lock_id
                );
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let key = self.key(LOCK_KEY);

        if let Some(object) = self.get_object(&key).await? {
            let lock_info: LockInfo = serde_json::from_slice(&object.content)
                .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
            return Ok(Some(lock_info));
        }

        Ok(None)
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(SNAPSHOT_KEY))
    }
}
