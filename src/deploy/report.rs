//! Deployment reports.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::resource::Urn;

use super::step::{StepKind, StepStatus};

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    /// The resource.
    pub urn: Urn,
    /// What was done, or would have been done.
    pub kind: StepKind,
    /// Final status.
    pub status: StepStatus,
    /// Failure or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider attempts made.
    #[serde(skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Result of a deployment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentReport {
    /// Per-step outcomes in completion order.
    pub steps: Vec<StepReport>,
    /// Number of steps that succeeded.
    pub succeeded: usize,
    /// Number of steps that failed.
    pub failed: usize,
    /// Number of steps skipped.
    pub skipped: usize,
    /// Conditions worth surfacing that did not fail a step.
    pub warnings: Vec<String>,
    /// Revision of the last snapshot written, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// The deployment was cancelled.
    pub cancelled: bool,
    /// Nothing was executed or persisted.
    pub dry_run: bool,
}

impl DeploymentReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Appends a step outcome.
    pub fn record(&mut self, step: StepReport) {
        match step.status {
            StepStatus::Succeeded => self.succeeded += 1,
            StepStatus::Failed => self.failed += 1,
            StepStatus::Skipped => self.skipped += 1,
            StepStatus::Pending | StepStatus::Ready | StepStatus::Running => {}
        }
        self.steps.push(step);
    }

    /// Records a successful step.
    pub fn succeeded(&mut self, urn: Urn, kind: StepKind, attempts: u32) {
        self.record(StepReport {
            urn,
            kind,
            status: StepStatus::Succeeded,
            error: None,
            attempts,
        });
    }

    /// Records a failed step.
    pub fn failed(&mut self, urn: Urn, kind: StepKind, error: impl ToString, attempts: u32) {
        self.record(StepReport {
            urn,
            kind,
            status: StepStatus::Failed,
            error: Some(error.to_string()),
            attempts,
        });
    }

    /// Records a skipped step.
    pub fn skipped(&mut self, urn: Urn, kind: StepKind, reason: impl ToString) {
        self.record(StepReport {
            urn,
            kind,
            status: StepStatus::Skipped,
            error: Some(reason.to_string()),
            attempts: 0,
        });
    }

    /// Adds a warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Returns true if no step failed and the run was not cancelled.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Returns the report for a resource's step of the given kind.
    #[must_use]
    pub fn step(&self, urn: &Urn, kind: StepKind) -> Option<&StepReport> {
        self.steps.iter().find(|s| &s.urn == urn && s.kind == kind)
    }

    /// Returns the reports for a resource.
    pub fn steps_for<'a>(&'a self, urn: &'a Urn) -> impl Iterator<Item = &'a StepReport> {
        self.steps.iter().filter(move |s| &s.urn == urn)
    }

    /// Counts successful steps by kind, leaving out unchanged resources.
    #[must_use]
    pub fn changes(&self) -> BTreeMap<StepKind, usize> {
        let mut changes = BTreeMap::new();
        for step in &self.steps {
            if step.status == StepStatus::Succeeded && step.kind != StepKind::Same {
                *changes.entry(step.kind).or_insert(0) += 1;
            }
        }
        changes
    }
}

impl std::fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} steps: {} successful, {} failed, {} skipped",
            self.steps.len(),
            self.succeeded,
            self.failed,
            self.skipped
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        if self.dry_run {
            write!(f, " (dry run)")?;
        }
        Ok(())
    }
}
