//! Error types for the deployment engine.
//!
//! Errors are grouped by the component that raises them: configuration,
//! snapshot state, providers, plan generation and validation, step
//! execution, and the secrets boundary. Step-level errors are caught by the
//! executor and reported; only validation, conflict and storage failures
//! abort a deployment.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::resource::Urn;

/// The main error type for the deployment engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot state errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Plan generation and registration validation errors.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// Step execution errors.
    #[error("Step error: {0}")]
    Step(#[from] StepError),

    /// Secrets boundary errors.
    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The deployment was cancelled before it could finish.
    #[error("Deployment cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable holds an unusable value.
    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// The rejected value.
        value: String,
    },
}

/// Snapshot state errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// No snapshot exists at the target.
    #[error("Snapshot not found: {location}")]
    NotFound {
        /// Where the snapshot was expected.
        location: String,
    },

    /// The snapshot is corrupted or violates its invariants.
    #[error("Snapshot is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Another writer advanced the snapshot since this deployment started.
    #[error("Snapshot conflict: expected revision {expected}, found {found}")]
    Conflict {
        /// Revision this deployment started from.
        expected: u64,
        /// Revision currently stored.
        found: u64,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend failure (filesystem, S3, ...).
    #[error("{backend} snapshot backend error: {message}")]
    Backend {
        /// Backend type name.
        backend: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("Snapshot serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Snapshot format version is not supported.
    #[error("Snapshot version mismatch: expected at most {expected}, found {found}")]
    VersionMismatch {
        /// Highest supported format version.
        expected: u32,
        /// Version found in the document.
        found: u32,
    },
}

/// Provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The referenced provider has not been created or loaded yet.
    #[error("Provider not found: {reference}")]
    NotFound {
        /// The unresolved provider reference.
        reference: String,
    },

    /// The provider reported a failure.
    #[error("Provider {package} failed: {message}")]
    Failure {
        /// Provider package.
        package: String,
        /// Error message from the provider.
        message: String,
        /// Whether the provider marked this error as transient.
        retryable: bool,
    },

    /// The provider created or updated a resource but could not confirm all
    /// of its outputs.
    #[error("Provider {package} partially completed {urn}: {}", reasons.join("; "))]
    Partial {
        /// Provider package.
        package: String,
        /// Resource the operation was for.
        urn: Urn,
        /// Physical id, if one was assigned.
        id: Option<String>,
        /// Whatever outputs the provider returned.
        outputs: crate::resource::PropertyMap,
        /// Reasons the operation is incomplete.
        reasons: Vec<String>,
    },

    /// The capability call exceeded its deadline.
    #[error("Provider {package} timed out after {timeout:?} during {operation}")]
    Timeout {
        /// Provider package.
        package: String,
        /// Capability that timed out.
        operation: &'static str,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The provider violated the wire protocol.
    #[error("Provider {package} protocol violation: {message}")]
    Protocol {
        /// Provider package.
        package: String,
        /// Description of the violation.
        message: String,
    },

    /// The provider process exited.
    #[error("Provider {package} crashed: {message}")]
    Crashed {
        /// Provider package.
        package: String,
        /// Exit details.
        message: String,
    },

    /// No plugin could be found for the requested package.
    #[error("No plugin found for package {package} (version {version})")]
    PluginNotFound {
        /// Requested package.
        package: String,
        /// Requested version, or `latest`.
        version: String,
    },

    /// The provider does not implement the capability.
    #[error("Provider {package} does not support {operation}")]
    Unsupported {
        /// Provider package.
        package: String,
        /// Capability requested.
        operation: &'static str,
    },
}

/// Plan generation and registration validation errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A urn was registered more than once.
    #[error("Duplicate resource urn: {urn}")]
    DuplicateUrn {
        /// The duplicated urn.
        urn: Urn,
    },

    /// Registrations form a dependency cycle.
    #[error("Circular dependency detected: {cycle}")]
    CyclicDependency {
        /// Description of the cycle.
        cycle: String,
    },

    /// A registration depends on a resource the program no longer declares.
    #[error("{urn} depends on {dependency}, which is not part of this deployment")]
    UnknownDependency {
        /// The dependent resource.
        urn: Urn,
        /// The missing dependency.
        dependency: Urn,
    },

    /// A provider reference does not resolve to a provider resource.
    #[error("{urn} has an invalid provider reference {reference}: {reason}")]
    InvalidProviderReference {
        /// The resource carrying the reference.
        urn: Urn,
        /// The reference text.
        reference: String,
        /// Why it is invalid.
        reason: String,
    },

    /// The registration stream closed without its completion marker.
    #[error("Registration stream ended without a completion marker")]
    IncompleteStream,

    /// A registration is malformed.
    #[error("Invalid registration for {urn}: {message}")]
    InvalidRegistration {
        /// The offending urn.
        urn: Urn,
        /// Description of the problem.
        message: String,
    },

    /// A protected resource would have been deleted or replaced.
    #[error("Resource {urn} is protected and cannot be {operation}")]
    ProtectedResource {
        /// The protected resource.
        urn: Urn,
        /// `deleted` or `replaced`.
        operation: &'static str,
    },

    /// The provider rejected the inputs during Check.
    #[error("Invalid inputs for {urn}: {}", failures.join("; "))]
    CheckFailed {
        /// The resource.
        urn: Urn,
        /// Failure messages, one per property.
        failures: Vec<String>,
    },

    /// The scheduler reached a state where nothing can make progress.
    #[error("Deployment stalled: {message}")]
    Stalled {
        /// Description of the blocked steps.
        message: String,
    },
}

/// Step execution errors.
#[derive(Debug, Error)]
pub enum StepError {
    /// A step mutated real infrastructure but did not confirm its outputs.
    #[error("Step for {urn} partially completed: {message}")]
    Partial {
        /// The affected resource.
        urn: Urn,
        /// Description of what is unconfirmed.
        message: String,
    },

    /// A step failed after exhausting its retries.
    #[error("Maximum retry attempts ({attempts}) exceeded for {urn}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// The resource.
        urn: Urn,
    },

    /// A step was skipped because one of its dependencies failed.
    #[error("Step for {urn} skipped: dependency {dependency} did not succeed")]
    DependencyFailed {
        /// The skipped resource.
        urn: Urn,
        /// The failed dependency.
        dependency: Urn,
    },
}

/// Secrets boundary errors.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// A secret was encountered but no secrets provider is configured.
    #[error("Snapshot contains secrets but no secrets provider is configured")]
    NoSecretsProvider,

    /// Encryption failed.
    #[error("Failed to encrypt secret: {message}")]
    EncryptFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("Failed to decrypt secret: {message}")]
    DecryptFailed {
        /// Description of the failure.
        message: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Failure { retryable: true, .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay, if applicable.
    #[must_use]
    pub const fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Provider(ProviderError::Failure { retryable: true, .. }) => {
                Some(Duration::from_millis(500))
            }
            Self::State(StateError::LockFailed { .. }) => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// Returns true if this error must abort the whole deployment.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::State(_) | Self::Secrets(_) | Self::Cancelled | Self::Internal(_)
        ) || matches!(
            self,
            Self::Plan(
                PlanError::DuplicateUrn { .. }
                    | PlanError::CyclicDependency { .. }
                    | PlanError::UnknownDependency { .. }
                    | PlanError::InvalidProviderReference { .. }
                    | PlanError::IncompleteStream
                    | PlanError::InvalidRegistration { .. }
                    | PlanError::Stalled { .. }
            )
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a terminal provider failure.
    #[must_use]
    pub fn failure(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            package: package.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a transient provider failure that may be retried.
    #[must_use]
    pub fn transient(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            package: package.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a protocol violation error.
    #[must_use]
    pub fn protocol(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            package: package.into(),
            message: message.into(),
        }
    }

    /// Returns true if the provider marked this error as transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failure { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors_are_retryable() {
        let err = EngineError::from(ProviderError::transient("aws", "throttled"));
        assert!(err.is_retryable());
        assert!(err.retry_delay().is_some());
        assert!(!err.is_fatal());
    }

    #[test]
    fn terminal_provider_errors_are_not_retryable() {
        let err = EngineError::from(ProviderError::failure("aws", "bad request"));
        assert!(!err.is_retryable());
        assert!(err.retry_delay().is_none());
    }

    #[test]
    fn conflict_is_fatal() {
        let err = EngineError::from(StateError::Conflict {
            expected: 3,
            found: 4,
        });
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "State error: Snapshot conflict: expected revision 3, found 4"
        );
    }

    #[test]
    fn protect_violations_are_not_fatal() {
        let urn = Urn::parse("urn:converge:dev::app::test:Bucket::logs").unwrap();
        let err = EngineError::from(PlanError::ProtectedResource {
            urn,
            operation: "deleted",
        });
        assert!(!err.is_fatal());
    }
}
