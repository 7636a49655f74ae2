//! Engine configuration types.
//!
//! These map to the engine's YAML configuration file. Every field has a
//! default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::state::{LocalSnapshotStore, S3SnapshotStore, SnapshotStore};

/// The root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of steps in flight at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Keep running independent steps after a step fails.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Deadline for a single provider call, in seconds.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Checkpoint behaviour.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Snapshot storage.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider plugin discovery.
    #[serde(default)]
    pub plugins: PluginConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            continue_on_error: false,
            provider_timeout_secs: default_provider_timeout_secs(),
            retry: RetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
            state: StateConfig::default(),
            plugins: PluginConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Returns the provider call deadline.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Sets the parallelism bound.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets continue-on-error mode.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Retry policy for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy with no delay between attempts.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Returns the delay before retry number `retry` (1-based), capped at
    /// `max_delay_ms`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let delay = (self.initial_delay_ms as f64) * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Returns the delay before retry number `retry`, raised to the error's
    /// own suggestion when it asks for longer. Never exceeds `max_delay_ms`.
    #[must_use]
    pub fn backoff(&self, retry: u32, suggested: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        self.delay_for(retry).max(suggested.unwrap_or_default()).min(cap)
    }
}

/// Checkpoint behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Journal each mutating provider call before it starts.
    #[serde(default = "default_true")]
    pub journal_pending_operations: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            journal_pending_operations: true,
        }
    }
}

/// Snapshot storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local snapshot file path (for local backend).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StateConfig {
    /// Opens the configured snapshot store.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot determine its directory.
    pub async fn open_store(&self) -> Result<Box<dyn SnapshotStore>> {
        match self.backend {
            StateBackend::Local => {
                let store = match &self.path {
                    Some(path) => LocalSnapshotStore::with_snapshot_path(path),
                    None => LocalSnapshotStore::new()?,
                };
                Ok(Box::new(store))
            }
            StateBackend::S3 => {
                let bucket = self.bucket.as_deref().unwrap_or_default();
                let store =
                    S3SnapshotStore::new(bucket, self.prefix.as_deref(), self.region.as_deref()).await;
                Ok(Box::new(store))
            }
        }
    }
}

/// Snapshot backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based storage.
    #[default]
    Local,
    /// AWS S3-based storage.
    S3,
}

/// Provider plugin discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PluginConfig {
    /// Directories searched for `converge-resource-<package>` executables.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Explicit executable per package.
    #[serde(default)]
    pub overrides: BTreeMap<String, PathBuf>,
}

const fn default_parallelism() -> usize {
    10
}

const fn default_provider_timeout_secs() -> u64 {
    300
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_true() -> bool {
    true
}
