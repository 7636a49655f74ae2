//! Snapshot types.
//!
//! A snapshot is the ordered record of every live resource after the last
//! deployment, plus metadata about how it was produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::StateError;
use crate::resource::{ResourceState, Urn};
use crate::secrets::SecretsProviderInfo;

/// Engine version recorded in manifests.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A plugin used to produce a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Provider package.
    pub package: String,
    /// Plugin version, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Where the plugin was loaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Metadata describing how a snapshot was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// When the snapshot was written.
    pub time: DateTime<Utc>,
    /// Engine version that wrote it.
    pub engine_version: String,
    /// Provider plugins used.
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
    /// Fields written by newer engines.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            time: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
            plugins: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Kind of provider operation journaled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// A create is in flight.
    Creating,
    /// An update is in flight.
    Updating,
    /// A delete is in flight.
    Deleting,
    /// A read is in flight.
    Reading,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Reading => "reading",
        };
        write!(f, "{s}")
    }
}

/// An operation that had started but not finished when the snapshot was
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// The resource as it was sent to the provider.
    pub resource: ResourceState,
    /// What was being done to it.
    #[serde(rename = "type")]
    pub kind: OperationKind,
}

/// The ordered record of live resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Optimistic concurrency counter; 0 for a target never written.
    #[serde(default)]
    pub revision: u64,

    /// How the snapshot was produced.
    #[serde(default)]
    pub manifest: Manifest,

    /// Secrets provider the stored ciphertexts belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_provider: Option<SecretsProviderInfo>,

    /// Resources in dependency order.
    #[serde(default)]
    pub resources: Vec<ResourceState>,

    /// Operations that had not completed when the snapshot was written.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_operations: Vec<PendingOperation>,

    /// Fields written by newer engines.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Snapshot {
    /// Creates an empty snapshot for a target that has never been deployed.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            revision: 0,
            manifest: Manifest::default(),
            secrets_provider: None,
            resources: Vec::new(),
            pending_operations: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Creates a snapshot holding the given resources.
    #[must_use]
    pub fn with_resources(resources: Vec<ResourceState>) -> Self {
        Self {
            resources,
            ..Self::empty()
        }
    }

    /// Finds the live (not pending-delete) copy of a resource.
    #[must_use]
    pub fn find(&self, urn: &Urn) -> Option<&ResourceState> {
        self.resources.iter().find(|r| &r.urn == urn && !r.delete)
    }

    /// Returns true if the snapshot holds any copy of the urn.
    #[must_use]
    pub fn contains(&self, urn: &Urn) -> bool {
        self.resources.iter().any(|r| &r.urn == urn)
    }

    /// Returns the live resources.
    pub fn live_resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.iter().filter(|r| !r.delete)
    }

    /// Returns true if any resource is left partially initialized.
    #[must_use]
    pub fn has_partial_resources(&self) -> bool {
        self.resources.iter().any(ResourceState::is_partial)
    }

    /// Checks the ordering and uniqueness invariants.
    ///
    /// A urn may appear at most once without the `delete` marker. Every
    /// dependency, parent and provider reference must point at a resource
    /// earlier in the list, or at nothing in the snapshot at all (an
    /// external reference).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] describing the first violation.
    pub fn verify_integrity(&self) -> Result<(), StateError> {
        let all: HashSet<&Urn> = self.resources.iter().map(|r| &r.urn).collect();
        let mut seen: HashSet<&Urn> = HashSet::with_capacity(all.len());
        let mut live: HashSet<&Urn> = HashSet::with_capacity(all.len());

        for resource in &self.resources {
            if !resource.delete && !live.insert(&resource.urn) {
                return Err(StateError::corrupted(format!(
                    "duplicate live resource {}",
                    resource.urn
                )));
            }

            for reference in resource.references() {
                if reference == &resource.urn {
                    return Err(StateError::corrupted(format!(
                        "{} refers to itself",
                        resource.urn
                    )));
                }
                if all.contains(reference) && !seen.contains(reference) {
                    return Err(StateError::corrupted(format!(
                        "{} refers to {} which appears later in the snapshot",
                        resource.urn, reference
                    )));
                }
            }

            seen.insert(&resource.urn);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::PropertyMap;

    fn resource(name: &str, deps: &[&str]) -> ResourceState {
        let mut state = ResourceState::new(
            Urn::new("dev", "web", None, "test:Thing", name),
            PropertyMap::new(),
        );
        state.dependencies = deps
            .iter()
            .map(|d| Urn::new("dev", "web", None, "test:Thing", d))
            .collect();
        state
    }

    #[test]
    fn test_ordered_snapshot_is_valid() {
        let snapshot = Snapshot::with_resources(vec![resource("a", &[]), resource("b", &["a"])]);
        snapshot.verify_integrity().expect("valid");
    }

    #[test]
    fn test_forward_reference_is_corrupt() {
        let snapshot = Snapshot::with_resources(vec![resource("b", &["a"]), resource("a", &[])]);
        let err = snapshot.verify_integrity().unwrap_err();
        assert!(matches!(err, StateError::Corrupted { .. }));
    }

    #[test]
    fn test_external_reference_is_allowed() {
        let snapshot = Snapshot::with_resources(vec![resource("b", &["elsewhere"])]);
        snapshot.verify_integrity().expect("external references are fine");
    }

    #[test]
    fn test_duplicate_urns() {
        let snapshot = Snapshot::with_resources(vec![resource("a", &[]), resource("a", &[])]);
        assert!(snapshot.verify_integrity().is_err());

        let mut old = resource("a", &[]);
        old.delete = true;
        let snapshot = Snapshot::with_resources(vec![resource("a", &[]), old]);
        snapshot.verify_integrity().expect("pending-delete copy is allowed");
        assert!(!snapshot.find(&snapshot.resources[0].urn).is_some_and(|r| r.delete));
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let json = serde_json::json!({
            "revision": 4,
            "manifest": { "time": "2024-01-01T00:00:00Z", "engine_version": "9.9.9", "future": 1 },
            "resources": [],
            "checkpoint_hint": "x"
        });
        let snapshot: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(snapshot.revision, 4);
        assert_eq!(snapshot.extra.get("checkpoint_hint"), Some(&serde_json::json!("x")));
        assert_eq!(snapshot.manifest.extra.get("future"), Some(&serde_json::json!(1)));

        let back = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(back["checkpoint_hint"], "x");
        assert_eq!(back["manifest"]["future"], 1);
    }
}
