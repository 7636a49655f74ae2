//! Provider plugin discovery and loading.
//!
//! A [`PluginLoader`] turns a package name (and optional version) into a
//! fresh, unconfigured provider. The registry configures it afterwards.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PluginConfig;
use crate::error::ProviderError;

use super::capability::Provider;
use super::process::ProcessProvider;

/// Prefix of provider plugin executables.
pub const PLUGIN_EXECUTABLE_PREFIX: &str = "converge-resource-";

/// A provider produced by a loader.
#[derive(Clone)]
pub struct LoadedPlugin {
    /// The provider, not yet configured.
    pub provider: Arc<dyn Provider>,
    /// Where the plugin was loaded from, if it is a file.
    pub path: Option<PathBuf>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("package", &self.provider.info().package)
            .field("path", &self.path)
            .finish()
    }
}

/// Locates and starts provider plugins.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Loads the plugin for `package`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::PluginNotFound`] if no plugin serves the
    /// package at the requested version.
    async fn load(&self, package: &str, version: Option<&str>) -> Result<LoadedPlugin, ProviderError>;
}

fn not_found(package: &str, version: Option<&str>) -> ProviderError {
    ProviderError::PluginNotFound {
        package: package.to_string(),
        version: version.unwrap_or("latest").to_string(),
    }
}

/// Serves providers that live in the engine's own process.
#[derive(Default, Clone)]
pub struct StaticPluginLoader {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for StaticPluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut packages: Vec<_> = self.providers.keys().collect();
        packages.sort();
        f.debug_struct("StaticPluginLoader")
            .field("packages", &packages)
            .finish()
    }
}

impl StaticPluginLoader {
    /// Creates an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider, keyed by the package it reports.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Adds a provider, keyed by the package it reports.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let package = provider.info().package;
        debug!("Registered in-process provider: {}", package);
        self.providers.insert(package, provider);
    }
}

#[async_trait]
impl PluginLoader for StaticPluginLoader {
    async fn load(&self, package: &str, version: Option<&str>) -> Result<LoadedPlugin, ProviderError> {
        let provider = self
            .providers
            .get(package)
            .ok_or_else(|| not_found(package, version))?;

        if let (Some(wanted), Some(actual)) = (version, provider.info().version) {
            if wanted != actual {
                return Err(not_found(package, Some(wanted)));
            }
        }

        Ok(LoadedPlugin {
            provider: Arc::clone(provider),
            path: None,
        })
    }
}

/// Starts `converge-resource-<package>` executables as child processes.
///
/// Executables are resolved from explicit overrides, then the configured
/// search paths, then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ProcessPluginLoader {
    config: PluginConfig,
    use_path_env: bool,
}

impl ProcessPluginLoader {
    /// Creates a loader from plugin configuration, also searching `PATH`.
    #[must_use]
    pub const fn new(config: PluginConfig) -> Self {
        Self {
            config,
            use_path_env: true,
        }
    }

    /// Disables the `PATH` fallback.
    #[must_use]
    pub const fn without_path_env(mut self) -> Self {
        self.use_path_env = false;
        self
    }

    /// Returns the executable that would serve `package`, if any.
    #[must_use]
    pub fn resolve(&self, package: &str) -> Option<PathBuf> {
        if let Some(path) = self.config.overrides.get(package) {
            return Some(path.clone());
        }

        let name = format!("{PLUGIN_EXECUTABLE_PREFIX}{package}");
        let path_env = if self.use_path_env {
            std::env::var_os("PATH")
                .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        self.config
            .search_paths
            .iter()
            .chain(path_env.iter())
            .map(|dir| dir.join(&name))
            .find(|candidate| candidate.is_file())
    }
}

#[async_trait]
impl PluginLoader for ProcessPluginLoader {
    async fn load(&self, package: &str, version: Option<&str>) -> Result<LoadedPlugin, ProviderError> {
        let path = self
            .resolve(package)
            .ok_or_else(|| not_found(package, version))?;
        info!("Loading plugin for {}: {}", package, path.display());

        let provider = ProcessProvider::spawn(package, &path).await?;
        if let (Some(wanted), Some(actual)) = (version, provider.info().version.as_deref()) {
            if wanted != actual {
                return Err(not_found(package, Some(wanted)));
            }
        }

        Ok(LoadedPlugin {
            provider: Arc::new(provider),
            path: Some(path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::capability::MockProvider;
    use crate::provider::types::ProviderInfo;
    use tempfile::TempDir;

    fn mock(package: &'static str, version: Option<&'static str>) -> Arc<dyn Provider> {
        let mut mock = MockProvider::new();
        mock.expect_info().returning(move || {
            let info = ProviderInfo::new(package);
            match version {
                Some(v) => info.with_version(v),
                None => info,
            }
        });
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_static_loader_serves_registered_packages() {
        let loader = StaticPluginLoader::new().with_provider(mock("aws", Some("6.0.0")));

        let loaded = loader.load("aws", None).await.expect("load");
        assert!(loaded.path.is_none());
        loader.load("aws", Some("6.0.0")).await.expect("matching version");

        let err = loader.load("aws", Some("5.0.0")).await.unwrap_err();
        assert!(matches!(err, ProviderError::PluginNotFound { .. }));
        let err = loader.load("gcp", None).await.unwrap_err();
        assert!(matches!(err, ProviderError::PluginNotFound { version, .. } if version == "latest"));
    }

    #[test]
    fn test_resolve_prefers_overrides() {
        let temp = TempDir::new().expect("temp dir");
        let searched = temp.path().join("converge-resource-aws");
        std::fs::write(&searched, "").expect("write");

        let mut config = PluginConfig {
            search_paths: vec![temp.path().to_path_buf()],
            ..PluginConfig::default()
        };
        let loader = ProcessPluginLoader::new(config.clone()).without_path_env();
        assert_eq!(loader.resolve("aws"), Some(searched));
        assert_eq!(loader.resolve("gcp"), None);

        config
            .overrides
            .insert("aws".to_string(), PathBuf::from("/opt/aws-plugin"));
        let loader = ProcessPluginLoader::new(config).without_path_env();
        assert_eq!(loader.resolve("aws"), Some(PathBuf::from("/opt/aws-plugin")));
    }

    #[tokio::test]
    async fn test_missing_executable_is_plugin_not_found() {
        let loader = ProcessPluginLoader::new(PluginConfig::default()).without_path_env();
        let err = loader.load("nothing", Some("1.0.0")).await.unwrap_err();
        assert!(matches!(err, ProviderError::PluginNotFound { .. }));
    }
}
