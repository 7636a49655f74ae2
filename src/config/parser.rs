//! Configuration parser for loading engine configuration.
//!
//! Configuration comes from a YAML file, then `CONVERGE_*` environment
//! variables (optionally loaded from a `.env` file) override individual
//! fields.

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::settings::{EngineConfig, StateBackend};

/// Environment variable overriding `parallelism`.
pub const ENV_PARALLELISM: &str = "CONVERGE_PARALLELISM";
/// Environment variable overriding `continue_on_error`.
pub const ENV_CONTINUE_ON_ERROR: &str = "CONVERGE_CONTINUE_ON_ERROR";
/// Environment variable overriding `state.path`.
pub const ENV_STATE_PATH: &str = "CONVERGE_STATE_PATH";
/// Environment variable overriding `state.bucket` (selects the S3 backend).
pub const ENV_STATE_BUCKET: &str = "CONVERGE_STATE_BUCKET";
/// Environment variable overriding `state.prefix`.
pub const ENV_STATE_PREFIX: &str = "CONVERGE_STATE_PREFIX";

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Configuration parser for loading engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Ok(EngineConfig::default());
        }

        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            }
        })?;

        debug!(
            "Parsed configuration: parallelism={}, continue_on_error={}",
            config.parallelism, config.continue_on_error
        );
        Ok(config)
    }

    /// Loads configuration, loads `.env`, and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override holds an unusable value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let mut config = self.load_file(path)?;
        self.load_dotenv()?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `CONVERGE_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnvVar`] if a value cannot be parsed.
    pub fn apply_env_overrides(
        config: &mut EngineConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(value) = lookup(ENV_PARALLELISM) {
            debug!("Overriding parallelism from environment");
            config.parallelism = value.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
                name: ENV_PARALLELISM.to_string(),
                value: value.clone(),
            })?;
        }

        if let Some(value) = lookup(ENV_CONTINUE_ON_ERROR) {
            debug!("Overriding continue_on_error from environment");
            config.continue_on_error = parse_bool(&value).ok_or_else(|| ConfigError::InvalidEnvVar {
                name: ENV_CONTINUE_ON_ERROR.to_string(),
                value: value.clone(),
            })?;
        }

        if let Some(path) = lookup(ENV_STATE_PATH) {
            debug!("Overriding state.path from environment");
            config.state.path = Some(PathBuf::from(path));
        }

        if let Some(bucket) = lookup(ENV_STATE_BUCKET) {
            debug!("Overriding state.bucket from environment");
            config.state.backend = StateBackend::S3;
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup(ENV_STATE_PREFIX) {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty_config() {
        let config = ConfigParser::new().parse_yaml("", None).expect("empty is valid");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
parallelism: 4
continue_on_error: true
provider_timeout_secs: 60
retry:
  max_attempts: 5
  initial_delay_ms: 100
checkpoint:
  journal_pending_operations: false
state:
  backend: s3
  bucket: converge-state
  prefix: web/prod
plugins:
  search_paths:
    - /opt/converge/plugins
  overrides:
    aws: /usr/local/bin/converge-resource-aws
";
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(config.parallelism, 4);
        assert!(config.continue_on_error);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert!(!config.checkpoint.journal_pending_operations);
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.plugins.overrides.len(), 1);
    }

    #[test]
    fn test_parse_error() {
        let err = ConfigParser::new()
            .parse_yaml("parallelism: [", None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_PARALLELISM, "2"),
            (ENV_CONTINUE_ON_ERROR, "yes"),
            (ENV_STATE_BUCKET, "bucket"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        ConfigParser::apply_env_overrides(&mut config, |name| env.get(name).map(|v| (*v).to_string()))
            .expect("overrides");

        assert_eq!(config.parallelism, 2);
        assert!(config.continue_on_error);
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("bucket"));
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = EngineConfig::default();
        let err = ConfigParser::apply_env_overrides(&mut config, |name| {
            (name == ENV_PARALLELISM).then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(temp.path().join("converge.yaml"), "parallelism: 1\n").expect("write");
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp.path().join("converge.yaml"));
    }
}
