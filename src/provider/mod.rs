//! Resource providers.
//!
//! This module provides:
//! - The [`Provider`] capability trait and its request/response types
//! - [`ProviderHandle`], which applies call deadlines and serialization
//! - [`ProviderRegistry`], which manages provider resources
//! - Plugin loaders for in-process and out-of-process providers

mod capability;
pub mod codec;
mod handle;
mod plugin;
mod process;
mod registry;
mod types;

pub use capability::Provider;
pub use handle::ProviderHandle;
pub use plugin::{
    LoadedPlugin, PluginLoader, ProcessPluginLoader, StaticPluginLoader, PLUGIN_EXECUTABLE_PREFIX,
};
pub use process::ProcessProvider;
pub use registry::{ProviderRegistry, PROVIDER_VERSION_KEY};
pub use types::{
    CheckFailure, CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest,
    DiffChanges, DiffRequest, DiffResponse, InvokeRequest, InvokeResponse, ProviderInfo,
    ReadRequest, ReadResponse, UpdateRequest, UpdateResponse,
};

#[cfg(test)]
pub use capability::MockProvider;
