//! Resource urns.
//!
//! A urn identifies a resource within a deployment and stays stable across
//! deployments: `urn:converge:<stack>::<project>::<type>::<name>`. The type
//! segment may carry the parent type chain separated by `$`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Prefix every urn starts with.
const URN_PREFIX: &str = "urn:converge:";

/// Separator between urn segments.
const SEGMENT_SEPARATOR: &str = "::";

/// Type token prefix used by provider resources.
pub const PROVIDER_TYPE_PREFIX: &str = "converge:providers:";

/// Error returned when a string is not a valid urn.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid urn '{urn}': {reason}")]
pub struct UrnError {
    /// The rejected text.
    pub urn: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// Stable identifier of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn(String);

impl Urn {
    /// Builds a urn from its parts.
    #[must_use]
    pub fn new(
        stack: &str,
        project: &str,
        parent_type: Option<&str>,
        type_token: &str,
        name: &str,
    ) -> Self {
        let qualified = match parent_type {
            Some(parent) if !parent.is_empty() => format!("{parent}${type_token}"),
            _ => type_token.to_string(),
        };
        Self(format!(
            "{URN_PREFIX}{stack}{SEGMENT_SEPARATOR}{project}{SEGMENT_SEPARATOR}{qualified}{SEGMENT_SEPARATOR}{name}"
        ))
    }

    /// Parses and validates a urn.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not follow the urn format.
    pub fn parse(text: &str) -> Result<Self, UrnError> {
        let invalid = |reason| UrnError {
            urn: text.to_string(),
            reason,
        };

        let rest = text
            .strip_prefix(URN_PREFIX)
            .ok_or_else(|| invalid("missing urn:converge: prefix"))?;

        let mut segments = rest.splitn(4, SEGMENT_SEPARATOR);
        let stack = segments.next().unwrap_or_default();
        let project = segments.next().ok_or_else(|| invalid("missing project"))?;
        let qualified = segments.next().ok_or_else(|| invalid("missing type"))?;
        let name = segments.next().ok_or_else(|| invalid("missing name"))?;

        if stack.is_empty() {
            return Err(invalid("empty stack"));
        }
        if project.is_empty() {
            return Err(invalid("empty project"));
        }
        if qualified.is_empty() || qualified.ends_with('$') {
            return Err(invalid("empty type"));
        }
        if name.is_empty() {
            return Err(invalid("empty name"));
        }

        Ok(Self(text.to_string()))
    }

    fn segments(&self) -> (&str, &str, &str, &str) {
        let rest = &self.0[URN_PREFIX.len()..];
        let mut segments = rest.splitn(4, SEGMENT_SEPARATOR);
        let stack = segments.next().unwrap_or_default();
        let project = segments.next().unwrap_or_default();
        let qualified = segments.next().unwrap_or_default();
        let name = segments.next().unwrap_or_default();
        (stack, project, qualified, name)
    }

    /// Returns the stack segment.
    #[must_use]
    pub fn stack(&self) -> &str {
        self.segments().0
    }

    /// Returns the project segment.
    #[must_use]
    pub fn project(&self) -> &str {
        self.segments().1
    }

    /// Returns the qualified type including any parent type chain.
    #[must_use]
    pub fn qualified_type(&self) -> &str {
        self.segments().2
    }

    /// Returns the resource's own type token.
    #[must_use]
    pub fn type_token(&self) -> &str {
        let qualified = self.qualified_type();
        qualified.rsplit('$').next().unwrap_or(qualified)
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segments().3
    }

    /// Returns the package that owns the resource type.
    ///
    /// For provider resources this is the package the provider serves.
    #[must_use]
    pub fn package(&self) -> &str {
        let token = self.type_token();
        if let Some(package) = token.strip_prefix(PROVIDER_TYPE_PREFIX) {
            return package;
        }
        token.split(':').next().unwrap_or(token)
    }

    /// Returns true if this urn names a provider resource.
    #[must_use]
    pub fn is_provider(&self) -> bool {
        self.type_token().starts_with(PROVIDER_TYPE_PREFIX)
    }

    /// Returns the urn as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Urn {
    type Error = UrnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.0
    }
}

impl std::str::FromStr for Urn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
