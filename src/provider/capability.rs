//! The provider capability trait.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::resource::PropertyMap;

use super::types::{
    CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest, DiffRequest,
    DiffResponse, InvokeRequest, InvokeResponse, ProviderInfo, ReadRequest, ReadResponse,
    UpdateRequest, UpdateResponse,
};

/// A resource provider: the plugin that talks to one cloud or service.
///
/// Every capability may fail with a [`ProviderError`]. A create or update
/// that changed real infrastructure but could not confirm its outputs must
/// return [`ProviderError::Partial`] so the engine can record what exists.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Describes the provider.
    fn info(&self) -> ProviderInfo;

    /// Applies provider configuration. Called once before any other capability.
    async fn configure(&self, config: &PropertyMap) -> Result<(), ProviderError>;

    /// Validates and normalizes inputs.
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ProviderError>;

    /// Compares recorded state with new inputs.
    ///
    /// Providers that cannot diff keep the default, which reports
    /// [`ProviderError::Unsupported`].
    async fn diff(&self, request: DiffRequest) -> Result<DiffResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::Unsupported {
            package: self.info().package,
            operation: "diff",
        })
    }

    /// Creates a resource.
    async fn create(&self, request: CreateRequest) -> Result<CreateResponse, ProviderError>;

    /// Updates a resource in place.
    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, ProviderError>;

    /// Deletes a resource.
    async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError>;

    /// Reads an existing resource.
    async fn read(&self, request: ReadRequest) -> Result<ReadResponse, ProviderError>;

    /// Calls a provider function.
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::Unsupported {
            package: self.info().package,
            operation: "invoke",
        })
    }

    /// Releases provider resources. Called when the provider is unloaded.
    async fn shutdown(&self) {}
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Arc<P> {
    fn info(&self) -> ProviderInfo {
        (**self).info()
    }

    async fn configure(&self, config: &PropertyMap) -> Result<(), ProviderError> {
        (**self).configure(config).await
    }

    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ProviderError> {
        (**self).check(request).await
    }

    async fn diff(&self, request: DiffRequest) -> Result<DiffResponse, ProviderError> {
        (**self).diff(request).await
    }

    async fn create(&self, request: CreateRequest) -> Result<CreateResponse, ProviderError> {
        (**self).create(request).await
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, ProviderError> {
        (**self).update(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError> {
        (**self).delete(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResponse, ProviderError> {
        (**self).read(request).await
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        (**self).invoke(request).await
    }

    async fn shutdown(&self) {
        (**self).shutdown().await;
    }
}
