//! Checkpointing.
//!
//! [`WorkingSnapshot`] tracks what the snapshot should say at any moment of
//! a deployment: resources finished by this run in completion order,
//! followed by every prior resource the run has not yet replaced or removed,
//! in their original order. Both halves respect dependency order on their
//! own, and a finished resource only ever refers to resources that finished
//! before it, so every assembled snapshot passes the integrity check.
//!
//! [`CheckpointWriter`] persists those snapshots one at a time.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::resource::{ResourceState, Urn};
use crate::secrets::Encrypter;
use crate::state::{Manifest, OperationKind, PendingOperation, PluginInfo, Snapshot, SnapshotStore};

/// What became of a prior resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    /// Still recorded as it was.
    Untouched,
    /// Replaced by a copy this run recorded.
    Superseded,
    /// Kept, marked for deletion.
    PendingDelete,
    /// Removed.
    Deleted,
}

/// The snapshot as it evolves during a deployment.
#[derive(Debug, Clone)]
pub struct WorkingSnapshot {
    base: Snapshot,
    fates: Vec<Fate>,
    recorded: Vec<ResourceState>,
    pending: Vec<PendingOperation>,
}

impl WorkingSnapshot {
    /// Starts from a prior snapshot. Its pending operations are dropped.
    #[must_use]
    pub fn new(mut base: Snapshot) -> Self {
        base.pending_operations.clear();
        let fates = vec![Fate::Untouched; base.resources.len()];
        Self {
            base,
            fates,
            recorded: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// The prior snapshot.
    #[must_use]
    pub const fn base(&self) -> &Snapshot {
        &self.base
    }

    /// Returns the current live copy of a resource: the one this run
    /// recorded, or else the untouched prior one.
    #[must_use]
    pub fn find(&self, urn: &Urn) -> Option<&ResourceState> {
        self.recorded.iter().rev().find(|r| &r.urn == urn).or_else(|| {
            self.base
                .resources
                .iter()
                .zip(&self.fates)
                .find(|(r, fate)| &r.urn == urn && !r.delete && **fate == Fate::Untouched)
                .map(|(r, _)| r)
        })
    }

    /// Returns the number of resources this run recorded.
    #[must_use]
    pub fn recorded_len(&self) -> usize {
        self.recorded.len()
    }

    /// Records the state a step produced, superseding the prior live copy.
    pub fn record(&mut self, state: ResourceState) {
        if let Some(idx) = self.base_index(&state.urn, |r, fate| !r.delete && fate == Fate::Untouched) {
            self.fates[idx] = Fate::Superseded;
        }
        if let Some(existing) = self.recorded.iter_mut().find(|r| r.urn == state.urn) {
            *existing = state;
        } else {
            self.recorded.push(state);
        }
    }

    /// Marks the prior live copy of a resource for deletion.
    pub fn mark_pending_delete(&mut self, old: &ResourceState) {
        let found = self.base_index(&old.urn, |r, fate| {
            !r.delete && fate == Fate::Untouched && r.id == old.id
        });
        if let Some(idx) = found {
            self.fates[idx] = Fate::PendingDelete;
        }
    }

    /// Removes a prior resource. `pending` selects the copy marked for
    /// deletion rather than the live one.
    pub fn mark_deleted(&mut self, old: &ResourceState, pending: bool) {
        let found = self.base_index(&old.urn, |r, fate| {
            let marked = r.delete || fate == Fate::PendingDelete;
            matches!(fate, Fate::Untouched | Fate::PendingDelete) && marked == pending && r.id == old.id
        });
        if let Some(idx) = found {
            self.fates[idx] = Fate::Deleted;
        }
    }

    /// Journals an operation that is about to start.
    pub fn begin(&mut self, resource: ResourceState, kind: OperationKind) {
        self.pending.push(PendingOperation { resource, kind });
    }

    /// Clears a journaled operation once it has finished.
    pub fn end(&mut self, urn: &Urn, kind: OperationKind) {
        if let Some(idx) = self
            .pending
            .iter()
            .position(|op| &op.resource.urn == urn && op.kind == kind)
        {
            self.pending.remove(idx);
        }
    }

    /// Returns the operations currently journaled.
    #[must_use]
    pub fn pending_operations(&self) -> &[PendingOperation] {
        &self.pending
    }

    /// Assembles the snapshot to persist. Plugins loaded by this run take
    /// precedence over those the prior manifest lists.
    #[must_use]
    pub fn snapshot(&self, plugins: Vec<PluginInfo>) -> Snapshot {
        let mut merged: BTreeMap<String, PluginInfo> = self
            .base
            .manifest
            .plugins
            .iter()
            .map(|p| (p.package.clone(), p.clone()))
            .collect();
        for plugin in plugins {
            merged.insert(plugin.package.clone(), plugin);
        }

        let mut resources = self.recorded.clone();
        for (resource, fate) in self.base.resources.iter().zip(&self.fates) {
            match fate {
                Fate::Untouched => resources.push(resource.clone()),
                Fate::PendingDelete => {
                    let mut marked = resource.clone();
                    marked.delete = true;
                    resources.push(marked);
                }
                Fate::Superseded | Fate::Deleted => {}
            }
        }

        Snapshot {
            revision: self.base.revision,
            manifest: Manifest {
                time: Utc::now(),
                plugins: merged.into_values().collect(),
                ..self.base.manifest.clone()
            },
            secrets_provider: self.base.secrets_provider.clone(),
            resources,
            pending_operations: self.pending.clone(),
            extra: self.base.extra.clone(),
        }
    }

    fn base_index(&self, urn: &Urn, matches: impl Fn(&ResourceState, Fate) -> bool) -> Option<usize> {
        self.base
            .resources
            .iter()
            .zip(&self.fates)
            .position(|(r, &fate)| &r.urn == urn && matches(r, fate))
    }
}

/// Persists checkpoints with optimistic concurrency.
///
/// Writes are issued one at a time by the deployment's coordinator; each
/// names the revision the previous write produced.
pub struct CheckpointWriter {
    store: Arc<dyn SnapshotStore>,
    encrypter: Arc<dyn Encrypter>,
    revision: u64,
    enabled: bool,
    writes: usize,
}

impl std::fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("store", &self.store.location())
            .field("revision", &self.revision)
            .field("enabled", &self.enabled)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

impl CheckpointWriter {
    /// Creates a writer continuing from `revision`.
    #[must_use]
    pub fn new(store: Arc<dyn SnapshotStore>, encrypter: Arc<dyn Encrypter>, revision: u64) -> Self {
        Self {
            store,
            encrypter,
            revision,
            enabled: true,
            writes: 0,
        }
    }

    /// Disables persistence; writes become no-ops. Used for dry runs.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the revision of the last write, or the starting revision.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns the number of snapshots written.
    #[must_use]
    pub const fn writes(&self) -> usize {
        self.writes
    }

    /// Persists a snapshot as the next revision.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`](crate::error::StateError::Conflict)
    /// if another writer advanced the target, or any encoding or backend
    /// failure. Every such error is fatal to the deployment.
    pub async fn write(&mut self, snapshot: &Snapshot) -> Result<u64> {
        if !self.enabled {
            return Ok(self.revision);
        }
        let revision = self
            .store
            .save(snapshot, self.revision, self.encrypter.as_ref())
            .await?;
        debug!(
            "Checkpoint {} written: {} resources, {} pending operations",
            revision,
            snapshot.resources.len(),
            snapshot.pending_operations.len()
        );
        self.revision = revision;
        self.writes += 1;
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, StateError};
    use crate::resource::PropertyMap;
    use crate::secrets::NoSecretsCrypter;
    use crate::state::MemorySnapshotStore;

    fn state(name: &str, id: &str, deps: &[&str]) -> ResourceState {
        let mut state = ResourceState::new(
            Urn::new("dev", "web", None, "test:Thing", name),
            PropertyMap::new(),
        );
        state.id = Some(id.to_string());
        state.dependencies = deps
            .iter()
            .map(|d| Urn::new("dev", "web", None, "test:Thing", d))
            .collect();
        state
    }

    fn names(snapshot: &Snapshot) -> Vec<(String, bool)> {
        snapshot
            .resources
            .iter()
            .map(|r| (r.urn.name().to_string(), r.delete))
            .collect()
    }

    #[test]
    fn test_recorded_resources_come_first() {
        let base = Snapshot::with_resources(vec![state("a", "1", &[]), state("b", "2", &["a"])]);
        let mut working = WorkingSnapshot::new(base);

        working.record(state("a", "1", &[]));
        let snapshot = working.snapshot(Vec::new());
        assert_eq!(names(&snapshot), vec![("a".into(), false), ("b".into(), false)]);
        snapshot.verify_integrity().unwrap();
    }

    #[test]
    fn test_replacement_keeps_old_copy_until_deleted() {
        let base = Snapshot::with_resources(vec![state("a", "1", &[]), state("b", "2", &["a"])]);
        let mut working = WorkingSnapshot::new(base);
        let old = working.find(&state("a", "1", &[]).urn).cloned().unwrap();

        working.mark_pending_delete(&old);
        working.record(state("a", "9", &[]));
        let snapshot = working.snapshot(Vec::new());
        assert_eq!(
            names(&snapshot),
            vec![("a".into(), false), ("a".into(), true), ("b".into(), false)]
        );
        snapshot.verify_integrity().unwrap();
        assert_eq!(working.find(&old.urn).unwrap().id.as_deref(), Some("9"));

        working.mark_deleted(&old, true);
        let snapshot = working.snapshot(Vec::new());
        assert_eq!(names(&snapshot), vec![("a".into(), false), ("b".into(), false)]);
    }

    #[test]
    fn test_delete_removes_live_copy() {
        let base = Snapshot::with_resources(vec![state("a", "1", &[]), state("b", "2", &["a"])]);
        let mut working = WorkingSnapshot::new(base);

        working.mark_deleted(&state("b", "2", &["a"]), false);
        working.mark_deleted(&state("a", "1", &[]), false);
        assert!(working.snapshot(Vec::new()).resources.is_empty());
    }

    #[test]
    fn test_pending_operations_are_journaled() {
        let mut working = WorkingSnapshot::new(Snapshot::empty());
        let resource = state("a", "1", &[]);

        working.begin(resource.clone(), OperationKind::Creating);
        assert_eq!(working.snapshot(Vec::new()).pending_operations.len(), 1);

        working.end(&resource.urn, OperationKind::Creating);
        assert!(working.snapshot(Vec::new()).pending_operations.is_empty());
    }

    #[test]
    fn test_manifest_plugins_are_merged() {
        let mut base = Snapshot::empty();
        base.manifest.plugins = vec![
            PluginInfo {
                package: "aws".to_string(),
                version: Some("1.0.0".to_string()),
                path: None,
            },
            PluginInfo {
                package: "gcp".to_string(),
                version: None,
                path: None,
            },
        ];
        let working = WorkingSnapshot::new(base);
        let snapshot = working.snapshot(vec![PluginInfo {
            package: "aws".to_string(),
            version: Some("2.0.0".to_string()),
            path: None,
        }]);
        let versions: Vec<_> = snapshot
            .manifest
            .plugins
            .iter()
            .map(|p| (p.package.as_str(), p.version.as_deref()))
            .collect();
        assert_eq!(versions, vec![("aws", Some("2.0.0")), ("gcp", None)]);
    }

    #[tokio::test]
    async fn test_writer_tracks_revisions() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut writer = CheckpointWriter::new(store.clone(), Arc::new(NoSecretsCrypter), 0);

        assert_eq!(writer.write(&Snapshot::empty()).await.unwrap(), 1);
        assert_eq!(writer.write(&Snapshot::empty()).await.unwrap(), 2);
        assert_eq!(store.save_count(), 2);
        assert_eq!(writer.writes(), 2);
    }

    #[tokio::test]
    async fn test_writer_detects_other_writers() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut writer = CheckpointWriter::new(store.clone(), Arc::new(NoSecretsCrypter), 0);
        writer.write(&Snapshot::empty()).await.unwrap();

        let mut other = CheckpointWriter::new(store, Arc::new(NoSecretsCrypter), 1);
        other.write(&Snapshot::empty()).await.unwrap();

        let err = writer.write(&Snapshot::empty()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::Conflict { expected: 1, found: 2 })
        ));
    }

    #[tokio::test]
    async fn test_disabled_writer_does_not_save() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut writer = CheckpointWriter::new(store.clone(), Arc::new(NoSecretsCrypter), 3).disabled();
        assert_eq!(writer.write(&Snapshot::empty()).await.unwrap(), 3);
        assert_eq!(store.save_count(), 0);
    }
}
