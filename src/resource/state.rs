//! Resource state as recorded in a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::property::{PropertyMap, PropertyValue, UNKNOWN_SENTINEL};
use super::urn::{Urn, UrnError};

/// Reference to the provider instance that manages a resource.
///
/// The string form is `<provider urn>::<provider id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderReference {
    /// Urn of the provider resource.
    pub urn: Urn,
    /// Id the provider resource was assigned when it was created.
    pub id: String,
}

impl ProviderReference {
    /// Creates a new provider reference.
    #[must_use]
    pub fn new(urn: Urn, id: impl Into<String>) -> Self {
        Self { urn, id: id.into() }
    }

    /// Parses the `<urn>::<id>` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the text has no id or the urn part is invalid.
    pub fn parse(text: &str) -> Result<Self, UrnError> {
        let (urn, id) = text.rsplit_once("::").ok_or_else(|| UrnError {
            urn: text.to_string(),
            reason: "provider reference has no id",
        })?;
        if id.is_empty() {
            return Err(UrnError {
                urn: text.to_string(),
                reason: "provider reference has an empty id",
            });
        }
        let urn = Urn::parse(urn)?;
        if !urn.is_provider() {
            return Err(UrnError {
                urn: text.to_string(),
                reason: "provider reference does not name a provider resource",
            });
        }
        Ok(Self::new(urn, id))
    }

    /// Returns true if the provider's id is not known yet (preview only).
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN_SENTINEL
    }

    /// Returns the package this provider serves.
    #[must_use]
    pub fn package(&self) -> &str {
        self.urn.package()
    }
}

impl TryFrom<String> for ProviderReference {
    type Error = UrnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProviderReference> for String {
    fn from(reference: ProviderReference) -> Self {
        reference.to_string()
    }
}

impl fmt::Display for ProviderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.urn, self.id)
    }
}

/// The recorded state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceState {
    /// Stable identifier.
    pub urn: Urn,

    /// True for provider-managed resources, false for components.
    #[serde(default = "default_custom")]
    pub custom: bool,

    /// Physical id assigned by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Inputs as last sent to the provider.
    #[serde(default)]
    pub inputs: PropertyMap,

    /// Outputs as last returned by the provider.
    #[serde(default)]
    pub outputs: PropertyMap,

    /// Parent resource, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,

    /// Provider managing this resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderReference>,

    /// Resources this one depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,

    /// Refuses delete and replace while set.
    #[serde(default, skip_serializing_if = "is_false")]
    pub protect: bool,

    /// Deleting only forgets the resource; the provider is not called.
    #[serde(default, skip_serializing_if = "is_false")]
    pub retain_on_delete: bool,

    /// Adopted through a read; never deleted through its provider.
    #[serde(default, skip_serializing_if = "is_false")]
    pub external: bool,

    /// A replaced copy waiting for its delete.
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,

    /// Why the last operation on this resource did not fully complete.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_errors: Vec<String>,

    /// Output keys that must be stored as secrets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_secret_outputs: Vec<String>,

    /// When the resource was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the resource was last modified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,

    /// Fields written by newer engines, preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

const fn default_custom() -> bool {
    true
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

impl ResourceState {
    /// Creates a custom resource state with the given inputs.
    #[must_use]
    pub fn new(urn: Urn, inputs: PropertyMap) -> Self {
        Self {
            urn,
            custom: true,
            id: None,
            inputs,
            outputs: PropertyMap::new(),
            parent: None,
            provider: None,
            dependencies: Vec::new(),
            protect: false,
            retain_on_delete: false,
            external: false,
            delete: false,
            init_errors: Vec::new(),
            additional_secret_outputs: Vec::new(),
            created_at: None,
            modified_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Returns the resource's type token.
    #[must_use]
    pub fn type_token(&self) -> &str {
        self.urn.type_token()
    }

    /// Returns true if the last operation left the resource partially
    /// initialized.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.init_errors.is_empty()
    }

    /// Returns every urn this resource refers to: dependencies, parent and
    /// provider.
    pub fn references(&self) -> impl Iterator<Item = &Urn> {
        self.dependencies
            .iter()
            .chain(self.parent.iter())
            .chain(self.provider.iter().map(|p| &p.urn))
    }

    /// Returns true if any input or output holds a secret.
    #[must_use]
    pub fn contains_secrets(&self) -> bool {
        self.inputs
            .values()
            .chain(self.outputs.values())
            .any(PropertyValue::contains_secrets)
    }
}
