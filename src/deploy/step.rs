//! Step model.
//!
//! A step is one planned infrastructure operation tied to a urn. Steps carry
//! the old resource (what the snapshot records) and the new resource (what
//! the program asked for) as applicable.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::resource::{ResourceState, Urn};
use crate::state::OperationKind;

/// Index of a step inside one deployment's scheduler.
pub type StepId = usize;

/// Kind of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Nothing changed; prior outputs carry forward.
    Same,
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource the program no longer declares.
    Delete,
    /// Replace a resource. Executed as a create-replacement and a
    /// delete-replaced step.
    Replace,
    /// Create the new copy of a replaced resource.
    CreateReplacement,
    /// Delete the old copy of a replaced resource.
    DeleteReplaced,
    /// Adopt an existing resource by id.
    Read,
}

impl StepKind {
    /// Returns true if the step calls a mutating provider capability.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::Same | Self::Replace)
    }

    /// Returns true if the step removes a resource.
    #[must_use]
    pub const fn is_delete(self) -> bool {
        matches!(self, Self::Delete | Self::DeleteReplaced)
    }

    /// The operation journaled while the step is in flight, if any.
    #[must_use]
    pub const fn operation(self) -> Option<OperationKind> {
        match self {
            Self::Create | Self::CreateReplacement => Some(OperationKind::Creating),
            Self::Update => Some(OperationKind::Updating),
            Self::Delete | Self::DeleteReplaced => Some(OperationKind::Deleting),
            Self::Read => Some(OperationKind::Reading),
            Self::Same | Self::Replace => None,
        }
    }

    /// Returns the kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Same => "same",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::CreateReplacement => "create-replacement",
            Self::DeleteReplaced => "delete-replaced",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a step in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for dependencies.
    Pending,
    /// Dependencies satisfied; waiting for a worker.
    Ready,
    /// Executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// Never ran because a dependency failed or the deployment stopped.
    Skipped,
}

impl StepStatus {
    /// Returns true once the step will not change status again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A concrete operation dispatched to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// What to do.
    pub kind: StepKind,
    /// Resource the step is about.
    pub urn: Urn,
    /// Recorded state, for update, delete and delete-replaced.
    pub old: Option<ResourceState>,
    /// Desired state, for create, update, create-replacement and read.
    pub new: Option<ResourceState>,
}

impl Step {
    /// A create step.
    #[must_use]
    pub fn create(new: ResourceState) -> Self {
        Self {
            kind: StepKind::Create,
            urn: new.urn.clone(),
            old: None,
            new: Some(new),
        }
    }

    /// An update step.
    #[must_use]
    pub fn update(old: ResourceState, new: ResourceState) -> Self {
        Self {
            kind: StepKind::Update,
            urn: new.urn.clone(),
            old: Some(old),
            new: Some(new),
        }
    }

    /// A delete step for a resource no longer declared.
    #[must_use]
    pub fn delete(old: ResourceState) -> Self {
        Self {
            kind: StepKind::Delete,
            urn: old.urn.clone(),
            old: Some(old),
            new: None,
        }
    }

    /// The create half of a replacement.
    #[must_use]
    pub fn create_replacement(old: ResourceState, new: ResourceState) -> Self {
        Self {
            kind: StepKind::CreateReplacement,
            urn: new.urn.clone(),
            old: Some(old),
            new: Some(new),
        }
    }

    /// The delete half of a replacement.
    #[must_use]
    pub fn delete_replaced(old: ResourceState) -> Self {
        Self {
            kind: StepKind::DeleteReplaced,
            urn: old.urn.clone(),
            old: Some(old),
            new: None,
        }
    }

    /// A read step adopting `new.id`.
    #[must_use]
    pub fn read(new: ResourceState) -> Self {
        Self {
            kind: StepKind::Read,
            urn: new.urn.clone(),
            old: None,
            new: Some(new),
        }
    }

    /// Returns true if the step removes the resource from the snapshot
    /// without calling its provider.
    #[must_use]
    pub fn only_forgets(&self) -> bool {
        self.kind.is_delete()
            && self
                .old
                .as_ref()
                .is_some_and(|old| old.retain_on_delete || old.external || !old.custom)
    }

    /// The resource the step sends to the provider.
    #[must_use]
    pub fn subject(&self) -> Option<&ResourceState> {
        if self.kind.is_delete() {
            self.old.as_ref()
        } else {
            self.new.as_ref().or(self.old.as_ref())
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.urn)
    }
}
