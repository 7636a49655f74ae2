//! Snapshot state management.
//!
//! This module provides the snapshot model, its persisted document format,
//! and the storage backends that hold it between deployments.

mod document;
mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use document::{SnapshotDocument, SNAPSHOT_FORMAT_VERSION};
pub use local::LocalSnapshotStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS};
pub use memory::MemorySnapshotStore;
pub use s3::S3SnapshotStore;
pub use store::SnapshotStore;
pub use types::{Manifest, OperationKind, PendingOperation, PluginInfo, Snapshot, ENGINE_VERSION};
