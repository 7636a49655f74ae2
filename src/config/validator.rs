//! Configuration validation.
//!
//! Collects every problem in a configuration before reporting, so a user
//! sees all errors at once. Errors fail validation; warnings do not.

use crate::error::{ConfigError, Result};
use tracing::{debug, warn};

use super::settings::{EngineConfig, PluginConfig, RetryConfig, StateBackend, StateConfig};

/// Parallelism above this is almost certainly a typo.
const PARALLELISM_WARN_THRESHOLD: usize = 256;

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an engine configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_execution(config, &mut result);
        Self::validate_retry(&config.retry, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_plugins(&config.plugins, &mut result);

        for warning in &result.warnings {
            warn!("Configuration warning: {}", warning);
        }

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConfigError::validation(first_error.message.clone(), first_error.field.clone()).into())
        }
    }

    fn validate_execution(config: &EngineConfig, result: &mut ValidationResult) {
        if config.parallelism == 0 {
            result.error("parallelism", "Parallelism must be at least 1");
        } else if config.parallelism > PARALLELISM_WARN_THRESHOLD {
            result.warnings.push(format!(
                "Parallelism of {} is unusually high",
                config.parallelism
            ));
        }

        if config.provider_timeout_secs == 0 {
            result.error("provider_timeout_secs", "Provider timeout must be at least 1 second");
        }
    }

    fn validate_retry(retry: &RetryConfig, result: &mut ValidationResult) {
        if retry.max_attempts == 0 {
            result.error("retry.max_attempts", "At least one attempt is required");
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            result.error(
                "retry.multiplier",
                format!("Backoff multiplier must be >= 1.0, got {}", retry.multiplier),
            );
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            result.error(
                "retry.initial_delay_ms",
                format!(
                    "Initial delay {}ms exceeds maximum delay {}ms",
                    retry.initial_delay_ms, retry.max_delay_ms
                ),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the S3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_plugins(plugins: &PluginConfig, result: &mut ValidationResult) {
        for (package, path) in &plugins.overrides {
            if !is_valid_package(package) {
                result.error(
                    "plugins.overrides",
                    format!("Invalid package name '{package}'"),
                );
            }
            if path.as_os_str().is_empty() {
                result.error(
                    "plugins.overrides",
                    format!("Empty executable path for package '{package}'"),
                );
            }
        }
    }
}

/// Package names are lowercase alphanumerics with `-` or `_`.
fn is_valid_package(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        let result = ConfigValidator::new()
            .validate(&EngineConfig::default())
            .expect("valid");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        let config = EngineConfig::default().with_parallelism(0);
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        match err {
            EngineError::Config(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field.as_deref(), Some("parallelism"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = EngineConfig::default();
        config.state.backend = StateBackend::S3;
        assert!(ConfigValidator::new().validate(&config).is_err());

        config.state.bucket = Some("b".to_string());
        ConfigValidator::new().validate(&config).expect("valid");
    }

    #[test]
    fn test_retry_bounds() {
        let mut config = EngineConfig::default();
        config.retry.multiplier = 0.5;
        config.retry.initial_delay_ms = 20_000;
        let mut result = ValidationResult::default();
        ConfigValidator::validate_retry(&config.retry, &mut result);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_plugin_override_names() {
        let mut config = EngineConfig::default();
        config
            .plugins
            .overrides
            .insert("Bad Name".to_string(), PathBuf::from("/bin/x"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_high_parallelism_warns() {
        let config = EngineConfig::default().with_parallelism(1000);
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warnings.len(), 1);
    }
}
