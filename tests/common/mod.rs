//! Common utilities for deployment integration tests.

#![allow(dead_code)]

pub mod fixtures;

use converge_engine::config::{EngineConfig, RetryConfig};
use converge_engine::deploy::{Deployment, DeploymentReport};
use converge_engine::error::Result;
use converge_engine::provider::StaticPluginLoader;
use converge_engine::resource::{
    PropertyMap, PropertyValue, ReadRegistration, Registration, RegistrationEvent,
    RegistrationStream, ResourceOptions, Urn,
};
use converge_engine::secrets::NoSecretsCrypter;
use converge_engine::state::{MemorySnapshotStore, Snapshot, SnapshotDocument, SnapshotStore};
use fixtures::FakeProvider;
use std::sync::Arc;

pub const STACK: &str = "dev";
pub const PROJECT: &str = "app";
pub const BUCKET: &str = "test:index:Bucket";

/// A memory store and a fake provider wired into deployments.
pub struct TestDeployment {
    pub store: Arc<MemorySnapshotStore>,
    pub provider: Arc<FakeProvider>,
    pub config: EngineConfig,
}

impl TestDeployment {
    /// Creates a setup with an empty store.
    pub fn new() -> Self {
        Self::with_store(MemorySnapshotStore::new())
    }

    /// Creates a setup over an existing store.
    pub fn with_store(store: MemorySnapshotStore) -> Self {
        init_tracing();
        Self {
            store: Arc::new(store),
            provider: Arc::new(FakeProvider::new()),
            config: EngineConfig::default().with_retry(RetryConfig::immediate(3)),
        }
    }

    /// Runs one step at a time, so checkpoints are deterministic.
    pub fn sequential(mut self) -> Self {
        self.config = self.config.with_parallelism(1);
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds a deployment against this setup.
    pub fn deployment(&self) -> Deployment {
        let loader = StaticPluginLoader::new().with_provider(self.provider.clone());
        Deployment::new(self.config.clone(), self.store.clone(), Arc::new(loader))
    }

    /// Runs a deployment of `registrations`.
    pub async fn run(&self, registrations: Vec<Registration>) -> Result<DeploymentReport> {
        self.deployment().run(stream(registrations)).await
    }

    /// Runs a deployment that is expected to finish.
    pub async fn deploy(&self, registrations: Vec<Registration>) -> DeploymentReport {
        self.run(registrations).await.expect("deployment")
    }

    /// Loads the current snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        self.store
            .load_or_empty(&NoSecretsCrypter)
            .await
            .expect("snapshot")
    }

    /// Names of resources in the current snapshot, provider resources
    /// excluded.
    pub async fn resource_names(&self) -> Vec<String> {
        self.snapshot()
            .await
            .resources
            .iter()
            .filter(|r| !r.urn.is_provider())
            .map(|r| r.urn.name().to_string())
            .collect()
    }
}

impl Default for TestDeployment {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Urn of a bucket.
pub fn urn(name: &str) -> Urn {
    Urn::new(STACK, PROJECT, None, BUCKET, name)
}

/// Urn of the default provider for the test package.
pub fn default_provider() -> Urn {
    Urn::new(STACK, PROJECT, None, "converge:providers:test", "default")
}

/// Property map from string pairs.
pub fn props(pairs: &[(&str, &str)]) -> PropertyMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), PropertyValue::String((*v).to_string())))
        .collect()
}

/// A bucket registration with a `size` input.
pub fn bucket(name: &str, size: &str) -> Registration {
    Registration::new(urn(name), props(&[("size", size)]))
}

/// A bucket registration with options.
pub fn bucket_with(name: &str, size: &str, options: ResourceOptions) -> Registration {
    bucket(name, size).with_options(options)
}

/// A read of an existing bucket.
pub fn read(name: &str, id: &str) -> RegistrationEvent {
    RegistrationEvent::Read(ReadRegistration {
        urn: urn(name),
        id: id.to_string(),
        inputs: props(&[("region", "eu")]),
        dependencies: Vec::new(),
        provider: None,
        parent: None,
    })
}

/// A complete stream of registrations.
pub fn stream(registrations: Vec<Registration>) -> RegistrationStream {
    events(
        registrations
            .into_iter()
            .map(RegistrationEvent::Register)
            .collect(),
    )
}

/// A complete stream of arbitrary events.
pub fn events(mut events: Vec<RegistrationEvent>) -> RegistrationStream {
    events.push(RegistrationEvent::Complete);
    RegistrationStream::from_events(events)
}

/// The parts of a checkpoint that must not depend on timing: resources
/// with their markers and non-provider ids, and in-flight operations.
pub async fn shape(document: &SnapshotDocument) -> (Vec<String>, Vec<String>) {
    let snapshot = document.decode(&NoSecretsCrypter).await.expect("decode");
    let resources = snapshot
        .resources
        .iter()
        .map(|r| {
            let id = if r.urn.is_provider() {
                "-"
            } else {
                r.id.as_deref().unwrap_or("")
            };
            format!(
                "{} id={} delete={} partial={}",
                r.urn.name(),
                id,
                r.delete,
                r.is_partial()
            )
        })
        .collect();
    let pending = snapshot
        .pending_operations
        .iter()
        .map(|op| format!("{} {}", op.kind, op.resource.urn.name()))
        .collect();
    (resources, pending)
}
