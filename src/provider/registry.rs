//! The provider registry.
//!
//! Providers are themselves resources (`converge:providers:<package>`). The
//! registry implements the create, update, delete and diff lifecycle for
//! those provider resources and keeps one configured [`ProviderHandle`] per
//! live provider reference. Ordinary resources resolve their provider here
//! once the provider's own step has completed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::resource::{PropertyMap, PropertyValue, ProviderReference, ResourceState, Urn, UNKNOWN_SENTINEL};
use crate::state::PluginInfo;

use super::handle::ProviderHandle;
use super::plugin::PluginLoader;
use super::types::{CheckFailure, CheckResponse, CreateResponse, DiffChanges, DiffResponse};

/// Provider input naming the plugin version to load.
pub const PROVIDER_VERSION_KEY: &str = "version";

/// Loads, configures and tracks provider instances.
pub struct ProviderRegistry {
    loader: Arc<dyn PluginLoader>,
    timeout: Duration,
    providers: RwLock<HashMap<ProviderReference, Arc<ProviderHandle>>>,
    plugins: Mutex<BTreeMap<String, PluginInfo>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("timeout", &self.timeout)
            .field("providers", &self.len())
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Creates a registry that loads plugins through `loader` and applies
    /// `timeout` to every provider call.
    #[must_use]
    pub fn new(loader: Arc<dyn PluginLoader>, timeout: Duration) -> Self {
        Self {
            loader,
            timeout,
            providers: RwLock::new(HashMap::new()),
            plugins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the number of loaded providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no provider is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a provider reference.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] if the referenced provider has not
    /// completed its own create or update step.
    pub fn get(&self, reference: &ProviderReference) -> Result<Arc<ProviderHandle>, ProviderError> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                reference: reference.to_string(),
            })
    }

    /// Returns the plugins loaded so far, for the snapshot manifest.
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Loads a provider recorded in a prior snapshot under its recorded id.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is not a provider resource or its
    /// plugin cannot be loaded and configured.
    pub async fn load_existing(&self, state: &ResourceState) -> Result<(), ProviderError> {
        let id = state
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::NotFound {
                reference: format!("{}::", state.urn),
            })?;
        let reference = ProviderReference::new(state.urn.clone(), id);
        if self.get(&reference).is_ok() {
            return Ok(());
        }
        let handle = self.instantiate(&reference, &state.inputs).await?;
        self.insert(handle);
        Ok(())
    }

    /// Validates provider configuration.
    #[must_use]
    pub fn check(&self, urn: &Urn, news: &PropertyMap) -> CheckResponse {
        let mut failures = Vec::new();
        if !urn.is_provider() {
            failures.push(CheckFailure {
                property: String::new(),
                reason: format!("{urn} is not a provider resource"),
            });
        }
        match news.get(PROVIDER_VERSION_KEY) {
            None | Some(PropertyValue::String(_) | PropertyValue::Computed) => {}
            Some(other) => failures.push(CheckFailure {
                property: PROVIDER_VERSION_KEY.to_string(),
                reason: format!("expected a string, got {}", other.type_name()),
            }),
        }
        CheckResponse {
            inputs: news.clone(),
            failures,
        }
    }

    /// Diffs provider configuration. A version change replaces the provider.
    #[must_use]
    pub fn diff(&self, olds: &PropertyMap, news: &PropertyMap) -> DiffResponse {
        let keys: BTreeSet<&String> = olds.keys().chain(news.keys()).collect();
        let changed: Vec<String> = keys
            .into_iter()
            .filter(|key| olds.get(*key) != news.get(*key))
            .cloned()
            .collect();

        if changed.is_empty() {
            return DiffResponse::unchanged();
        }
        let replaces = if changed.iter().any(|k| k == PROVIDER_VERSION_KEY) {
            vec![PROVIDER_VERSION_KEY.to_string()]
        } else {
            Vec::new()
        };
        DiffResponse {
            changes: DiffChanges::Some,
            replaces,
            changed_keys: changed,
            ..DiffResponse::default()
        }
    }

    /// Creates a provider resource: loads its plugin, configures it and
    /// assigns an id. In preview the id stays unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin cannot be loaded or configured.
    pub async fn create(
        &self,
        urn: &Urn,
        inputs: &PropertyMap,
        preview: bool,
    ) -> Result<CreateResponse, ProviderError> {
        let id = if preview {
            UNKNOWN_SENTINEL.to_string()
        } else {
            Uuid::new_v4().to_string()
        };
        let reference = ProviderReference::new(urn.clone(), id.clone());
        let handle = self.instantiate(&reference, inputs).await?;
        self.insert(handle);
        info!("Provider created: {}", reference);
        Ok(CreateResponse {
            id,
            outputs: inputs.clone(),
        })
    }

    /// Reconfigures a provider in place, keeping its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the new instance cannot be loaded or configured;
    /// the old instance stays registered.
    pub async fn update(
        &self,
        reference: &ProviderReference,
        inputs: &PropertyMap,
    ) -> Result<PropertyMap, ProviderError> {
        let handle = self.instantiate(reference, inputs).await?;
        if let Some(old) = self.insert(handle) {
            old.shutdown().await;
        }
        info!("Provider updated: {}", reference);
        Ok(inputs.clone())
    }

    /// Unloads a provider.
    pub async fn delete(&self, reference: &ProviderReference) {
        let removed = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference);
        match removed {
            Some(handle) => {
                handle.shutdown().await;
                info!("Provider deleted: {}", reference);
            }
            None => debug!("Provider {} was not loaded", reference),
        }
    }

    /// Shuts down every loaded provider.
    pub async fn shutdown_all(&self) {
        let handles: Vec<_> = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }

    async fn instantiate(
        &self,
        reference: &ProviderReference,
        inputs: &PropertyMap,
    ) -> Result<ProviderHandle, ProviderError> {
        let package = reference.package();
        let version = match inputs.get(PROVIDER_VERSION_KEY) {
            Some(PropertyValue::String(v)) => Some(v.as_str()),
            _ => None,
        };
        debug!(
            "Loading provider {} (version {})",
            package,
            version.unwrap_or("latest")
        );

        let loaded = self.loader.load(package, version).await?;
        let handle = ProviderHandle::new(reference.clone(), Arc::clone(&loaded.provider), self.timeout);

        match tokio::time::timeout(self.timeout, loaded.provider.configure(inputs)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Timeout {
                    package: package.to_string(),
                    operation: "configure",
                    timeout: self.timeout,
                })
            }
        }

        let info = handle.info();
        if info.package != package {
            warn!(
                "Plugin for {} reports package {}",
                package, info.package
            );
        }
        self.plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                package.to_string(),
                PluginInfo {
                    package: package.to_string(),
                    version: info.version.clone(),
                    path: loaded.path.as_ref().map(|p| p.display().to_string()),
                },
            );
        Ok(handle)
    }

    fn insert(&self, handle: ProviderHandle) -> Option<Arc<ProviderHandle>> {
        let reference = handle.reference().clone();
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference, Arc::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::capability::MockProvider;
    use crate::provider::plugin::StaticPluginLoader;
    use crate::provider::types::ProviderInfo;

    fn provider_urn() -> Urn {
        Urn::parse("urn:converge:dev::app::converge:providers:test::default").unwrap()
    }

    fn registry_with(mock: MockProvider) -> ProviderRegistry {
        let loader = StaticPluginLoader::new().with_provider(Arc::new(mock));
        ProviderRegistry::new(Arc::new(loader), Duration::from_secs(5))
    }

    fn configurable() -> MockProvider {
        let mut mock = MockProvider::new();
        mock.expect_info()
            .returning(|| ProviderInfo::new("test").with_version("1.0.0"));
        mock.expect_configure().returning(|_| Ok(()));
        mock.expect_shutdown().returning(|| ());
        mock
    }

    #[tokio::test]
    async fn test_provider_not_found_until_created() {
        let registry = registry_with(configurable());
        let urn = provider_urn();
        let guess = ProviderReference::new(urn.clone(), "nope");
        assert!(matches!(
            registry.get(&guess),
            Err(ProviderError::NotFound { .. })
        ));

        let created = registry
            .create(&urn, &PropertyMap::new(), false)
            .await
            .expect("create");
        let reference = ProviderReference::new(urn, created.id);
        let handle = registry.get(&reference).expect("registered");
        assert_eq!(handle.package(), "test");
        assert_eq!(registry.plugins()[0].version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_preview_create_keeps_id_unknown() {
        let registry = registry_with(configurable());
        let created = registry
            .create(&provider_urn(), &PropertyMap::new(), true)
            .await
            .expect("create");
        assert_eq!(created.id, UNKNOWN_SENTINEL);
    }

    #[tokio::test]
    async fn test_configure_failure_does_not_register() {
        let mut mock = MockProvider::new();
        mock.expect_info().returning(|| ProviderInfo::new("test"));
        mock.expect_configure()
            .returning(|_| Err(ProviderError::failure("test", "missing credentials")));
        let registry = registry_with(mock);

        let err = registry
            .create(&provider_urn(), &PropertyMap::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Failure { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_delete_unloads() {
        let registry = registry_with(configurable());
        let created = registry
            .create(&provider_urn(), &PropertyMap::new(), false)
            .await
            .expect("create");
        let reference = ProviderReference::new(provider_urn(), created.id);

        registry.delete(&reference).await;
        assert!(registry.get(&reference).is_err());
    }

    #[test]
    fn test_version_change_replaces() {
        let registry = registry_with(configurable());
        let mut olds = PropertyMap::new();
        olds.insert("version".to_string(), "1.0.0".into());
        olds.insert("region".to_string(), "eu".into());

        assert_eq!(registry.diff(&olds, &olds).changes, DiffChanges::None);

        let mut region = olds.clone();
        region.insert("region".to_string(), "us".into());
        let diff = registry.diff(&olds, &region);
        assert!(!diff.requires_replacement());
        assert_eq!(diff.changed_keys, vec!["region".to_string()]);

        let mut version = olds.clone();
        version.insert("version".to_string(), "2.0.0".into());
        assert!(registry.diff(&olds, &version).requires_replacement());
    }

    #[test]
    fn test_check_rejects_non_string_version() {
        let registry = registry_with(configurable());
        let mut news = PropertyMap::new();
        news.insert("version".to_string(), PropertyValue::Number(2.0));
        let checked = registry.check(&provider_urn(), &news);
        assert_eq!(checked.failures.len(), 1);
        assert_eq!(checked.failures[0].property, "version");
    }
}
