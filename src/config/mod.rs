//! Engine configuration.
//!
//! This module handles all configuration-related functionality:
//! - Parsing `converge.yaml` and applying environment overrides
//! - Validation of configuration values
//! - Opening the configured snapshot store

mod parser;
mod settings;
mod validator;

pub use parser::{
    find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, ENV_CONTINUE_ON_ERROR, ENV_PARALLELISM,
    ENV_STATE_BUCKET, ENV_STATE_PATH, ENV_STATE_PREFIX,
};
pub use settings::{
    CheckpointConfig, EngineConfig, PluginConfig, RetryConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
