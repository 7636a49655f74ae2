// ============================================================================
// Linting
// ============================================================================

#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code
#![warn(unused_imports)]              // Unused imports
#![warn(unused_variables)]            // Unused variables
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge Engine
//!
//! Resource planning and deployment executor for declarative infrastructure
//! programs.
//!
//! ## Overview
//!
//! A program describes the resources it wants as a stream of registrations.
//! The engine compares each registration with the snapshot left by the
//! previous deployment and converges reality to it:
//!
//! - Unchanged resources carry their outputs forward
//! - New resources are created, changed ones updated or replaced
//! - Resources the program no longer declares are deleted, dependents first
//! - Every completed step is checkpointed, so a crash leaves a consistent record
//!
//! ## Architecture
//!
//! 1. **Snapshot store**: the last-known-good resource set ([`state`])
//! 2. **Provider registry**: the plugins that manage resources ([`provider`])
//! 3. **Step generator**: decides what each registration needs ([`deploy`])
//! 4. **Scheduler**: releases steps once their dependencies completed
//! 5. **Step executor**: calls providers, retrying transient failures
//! 6. **Checkpoint writer**: persists progress after every step
//!
//! ## Modules
//!
//! - [`config`]: Engine configuration and environment overrides
//! - [`resource`]: Urns, property values and registrations
//! - [`provider`]: Provider capabilities, plugins and the registry
//! - [`state`]: Snapshots and their storage backends (local, S3, memory)
//! - [`secrets`]: The encryption boundary for secret values
//! - [`deploy`]: Step generation, scheduling, execution and checkpointing
//!
//! ## Example
//!
//! ```yaml
//! parallelism: 8
//! continue_on_error: false
//! provider_timeout_secs: 300
//! retry:
//!   max_attempts: 3
//! state:
//!   backend: local
//!   path: .converge/snapshot.json
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod deploy;
pub mod error;
pub mod provider;
pub mod resource;
pub mod secrets;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigParser, ConfigValidator, EngineConfig, RetryConfig};
pub use deploy::{Deployment, DeploymentReport, Step, StepKind, StepReport, StepStatus};
pub use error::{EngineError, Result};
pub use provider::{Provider, ProviderRegistry, StaticPluginLoader};
pub use resource::{
    PropertyMap, PropertyValue, Registration, RegistrationEvent, RegistrationStream,
    ResourceState, Urn,
};
pub use secrets::{Decrypter, Encrypter};
pub use state::{LocalSnapshotStore, MemorySnapshotStore, S3SnapshotStore, Snapshot, SnapshotStore};
