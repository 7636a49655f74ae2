//! Deployment engine.
//!
//! This module provides:
//! - Step generation from registrations and the prior snapshot
//! - The dependency graph and the step scheduler
//! - Step execution with retries
//! - Incremental checkpointing
//! - The [`Deployment`] coordinator and its [`DeploymentReport`]

mod checkpoint;
mod deployment;
mod executor;
mod generator;
mod graph;
mod report;
mod scheduler;
mod step;

pub use checkpoint::{CheckpointWriter, WorkingSnapshot};
pub use deployment::Deployment;
pub use executor::{StepExecutor, StepOutcome, StepResult};
pub use generator::{
    classify, default_provider_urn, delete_step, prepare, replace_mode, Change, Decision,
    DesiredResource, Generated, Prepared, StepGenerator, DEFAULT_PROVIDER_NAME,
};
pub use graph::DependencyGraph;
pub use report::{DeploymentReport, StepReport};
pub use scheduler::{Phase, Scheduler};
pub use step::{Step, StepId, StepKind, StepStatus};
