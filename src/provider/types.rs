//! Provider capability request and response types.
//!
//! These are the messages exchanged with a provider for each capability.
//! They serialize to JSON for out-of-process plugins; property maps use the
//! wire encoding of [`PropertyValue`](crate::resource::PropertyValue).

use serde::{Deserialize, Serialize};

use crate::resource::{PropertyMap, Urn};

/// What a provider says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Package served.
    pub package: String,
    /// Plugin version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Calls must not overlap; the engine serializes them.
    #[serde(default)]
    pub requires_serialization: bool,
}

impl ProviderInfo {
    /// Creates info for a package that accepts concurrent calls.
    #[must_use]
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: None,
            requires_serialization: false,
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Declares that calls must be serialized.
    #[must_use]
    pub const fn serialized(mut self) -> Self {
        self.requires_serialization = true;
        self
    }
}

/// Validate and normalize inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Resource being checked.
    pub urn: Urn,
    /// Inputs recorded for the prior deployment, empty if none.
    #[serde(default)]
    pub olds: PropertyMap,
    /// Inputs the program registered.
    pub news: PropertyMap,
}

/// One rejected property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    /// Offending property; empty for the whole resource.
    #[serde(default)]
    pub property: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Result of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Normalized inputs (defaults applied).
    pub inputs: PropertyMap,
    /// Validation failures; empty when valid.
    #[serde(default)]
    pub failures: Vec<CheckFailure>,
}

/// Compare old state with new inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRequest {
    /// Resource being diffed.
    pub urn: Urn,
    /// Physical id.
    pub id: String,
    /// Inputs recorded for the prior deployment.
    pub old_inputs: PropertyMap,
    /// Outputs recorded for the prior deployment.
    pub old_outputs: PropertyMap,
    /// Checked new inputs.
    pub new_inputs: PropertyMap,
}

/// Whether a diff found changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffChanges {
    /// The provider could not tell.
    #[default]
    Unknown,
    /// Nothing changed.
    None,
    /// Something changed.
    Some,
}

/// Result of a diff.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiffResponse {
    /// Overall verdict.
    #[serde(default)]
    pub changes: DiffChanges,
    /// Properties whose change forces replacement.
    #[serde(default)]
    pub replaces: Vec<String>,
    /// Every changed property.
    #[serde(default)]
    pub changed_keys: Vec<String>,
    /// Properties guaranteed not to change on update.
    #[serde(default)]
    pub stables: Vec<String>,
    /// The old resource must be deleted before its replacement is created.
    #[serde(default)]
    pub delete_before_replace: bool,
}

impl DiffResponse {
    /// A diff reporting no changes.
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            changes: DiffChanges::None,
            ..Self::default()
        }
    }

    /// A diff reporting in-place changes to `keys`.
    #[must_use]
    pub fn update(keys: &[&str]) -> Self {
        Self {
            changes: DiffChanges::Some,
            changed_keys: keys.iter().map(|k| (*k).to_string()).collect(),
            ..Self::default()
        }
    }

    /// A diff reporting that changes to `keys` force replacement.
    #[must_use]
    pub fn replace(keys: &[&str]) -> Self {
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        Self {
            changes: DiffChanges::Some,
            replaces: keys.clone(),
            changed_keys: keys,
            ..Self::default()
        }
    }

    /// Requests delete-before-replace ordering.
    #[must_use]
    pub const fn deleting_first(mut self) -> Self {
        self.delete_before_replace = true;
        self
    }

    /// Returns true if the change cannot be applied in place.
    #[must_use]
    pub fn requires_replacement(&self) -> bool {
        !self.replaces.is_empty()
    }
}

/// Create a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Resource being created.
    pub urn: Urn,
    /// Checked inputs.
    pub inputs: PropertyMap,
}

/// Result of a create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateResponse {
    /// Physical id assigned.
    pub id: String,
    /// Resulting outputs.
    #[serde(default)]
    pub outputs: PropertyMap,
}

/// Update a resource in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Resource being updated.
    pub urn: Urn,
    /// Physical id.
    pub id: String,
    /// Inputs recorded for the prior deployment.
    pub old_inputs: PropertyMap,
    /// Outputs recorded for the prior deployment.
    pub old_outputs: PropertyMap,
    /// Checked new inputs.
    pub new_inputs: PropertyMap,
}

/// Result of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// Resulting outputs.
    #[serde(default)]
    pub outputs: PropertyMap,
}

/// Delete a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Resource being deleted.
    pub urn: Urn,
    /// Physical id.
    pub id: String,
    /// Recorded inputs.
    pub inputs: PropertyMap,
    /// Recorded outputs.
    pub outputs: PropertyMap,
}

/// Read an existing resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Urn to record it under.
    pub urn: Urn,
    /// Physical id.
    pub id: String,
    /// Lookup hints.
    #[serde(default)]
    pub inputs: PropertyMap,
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResponse {
    /// Physical id, possibly normalized.
    pub id: String,
    /// Inputs reconstructed from the live resource.
    #[serde(default)]
    pub inputs: PropertyMap,
    /// Current outputs.
    #[serde(default)]
    pub outputs: PropertyMap,
}

/// Call a provider function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Function token, e.g. `aws:ec2:getAmi`.
    pub token: String,
    /// Arguments.
    #[serde(default)]
    pub args: PropertyMap,
}

/// Result of an invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    /// Return values.
    #[serde(default)]
    pub outputs: PropertyMap,
    /// Argument validation failures.
    #[serde(default)]
    pub failures: Vec<CheckFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_helpers() {
        assert!(!DiffResponse::unchanged().requires_replacement());
        assert!(!DiffResponse::update(&["size"]).requires_replacement());

        let replace = DiffResponse::replace(&["name"]).deleting_first();
        assert!(replace.requires_replacement());
        assert!(replace.delete_before_replace);
        assert_eq!(replace.changed_keys, vec!["name".to_string()]);
    }

    #[test]
    fn test_diff_defaults_to_unknown() {
        let diff: DiffResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(diff.changes, DiffChanges::Unknown);
    }
}
