//! Loaded provider instances.
//!
//! A [`ProviderHandle`] wraps a configured provider with the engine's call
//! policy: every capability call runs under a deadline, and providers that
//! declare `requires_serialization` get one call at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::resource::ProviderReference;

use super::capability::Provider;
use super::types::{
    CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest, DiffRequest,
    DiffResponse, InvokeRequest, InvokeResponse, ProviderInfo, ReadRequest, ReadResponse,
    UpdateRequest, UpdateResponse,
};

/// A configured provider bound to one provider resource.
pub struct ProviderHandle {
    /// Provider resource this instance belongs to.
    reference: ProviderReference,
    /// What the provider reported about itself.
    info: ProviderInfo,
    /// The provider.
    provider: Arc<dyn Provider>,
    /// Per-call deadline.
    timeout: Duration,
    /// Held for the duration of each call when calls must not overlap.
    serial: Option<Mutex<()>>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("reference", &self.reference)
            .field("info", &self.info)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProviderHandle {
    /// Wraps a configured provider.
    #[must_use]
    pub fn new(reference: ProviderReference, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        let info = provider.info();
        let serial = info.requires_serialization.then(|| Mutex::new(()));
        Self {
            reference,
            info,
            provider,
            timeout,
            serial,
        }
    }

    /// Returns the provider resource reference.
    #[must_use]
    pub const fn reference(&self) -> &ProviderReference {
        &self.reference
    }

    /// Returns the provider's self-description.
    #[must_use]
    pub const fn info(&self) -> &ProviderInfo {
        &self.info
    }

    /// Returns the provider package.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.info.package
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>> + Send,
    {
        let _guard = match &self.serial {
            Some(lock) => {
                trace!("Waiting for serialized provider {}", self.info.package);
                Some(lock.lock().await)
            }
            None => None,
        };

        debug!("Calling {} on provider {}", operation, self.reference);
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Timeout {
                    package: self.info.package.clone(),
                    operation,
                    timeout: self.timeout,
                })
            })
    }

    /// Validates and normalizes inputs.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError::Timeout`].
    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ProviderError> {
        self.call("check", self.provider.check(request)).await
    }

    /// Diffs recorded state against new inputs.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError::Timeout`].
    pub async fn diff(&self, request: DiffRequest) -> Result<DiffResponse, ProviderError> {
        self.call("diff", self.provider.diff(request)).await
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError::Timeout`].
    pub async fn create(&self, request: CreateRequest) -> Result<CreateResponse, ProviderError> {
        self.call("create", self.provider.create(request)).await
    }

    /// Updates a resource.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError::Timeout`].
    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, ProviderError> {
        self.call("update", self.provider.update(request)).await
    }

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError::Timeout`].
    pub async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError> {
        self.call("delete", self.provider.delete(request)).await
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError::Timeout`].
    pub async fn read(&self, request: ReadRequest) -> Result<ReadResponse, ProviderError> {
        self.call("read", self.provider.read(request)).await
    }

    /// Calls a provider function.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError::Timeout`].
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        self.call("invoke", self.provider.invoke(request)).await
    }

    /// Shuts the provider down.
    pub async fn shutdown(&self) {
        debug!("Shutting down provider {}", self.reference);
        if tokio::time::timeout(self.timeout, self.provider.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("Provider {} did not shut down in time", self.reference);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::capability::MockProvider;
    use crate::resource::{PropertyMap, Urn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reference() -> ProviderReference {
        let urn = Urn::parse("urn:converge:dev::app::converge:providers:test::default").unwrap();
        ProviderReference::new(urn, "id-1")
    }

    fn resource_urn() -> Urn {
        Urn::parse("urn:converge:dev::app::test:Thing::a").unwrap()
    }

    fn check_request() -> CheckRequest {
        CheckRequest {
            urn: resource_urn(),
            olds: PropertyMap::new(),
            news: PropertyMap::new(),
        }
    }

    struct Sleepy {
        delay: Duration,
        serialized: bool,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Sleepy {
        fn new(delay: Duration, serialized: bool) -> Self {
            Self {
                delay,
                serialized,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for Sleepy {
        fn info(&self) -> ProviderInfo {
            let info = ProviderInfo::new("test");
            if self.serialized { info.serialized() } else { info }
        }

        async fn configure(&self, _config: &PropertyMap) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ProviderError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(CheckResponse {
                inputs: request.news,
                failures: Vec::new(),
            })
        }

        async fn create(&self, _request: CreateRequest) -> Result<CreateResponse, ProviderError> {
            Err(ProviderError::failure("test", "not used"))
        }

        async fn update(&self, _request: UpdateRequest) -> Result<UpdateResponse, ProviderError> {
            Err(ProviderError::failure("test", "not used"))
        }

        async fn delete(&self, _request: DeleteRequest) -> Result<(), ProviderError> {
            Err(ProviderError::failure("test", "not used"))
        }

        async fn read(&self, _request: ReadRequest) -> Result<ReadResponse, ProviderError> {
            Err(ProviderError::failure("test", "not used"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let handle = ProviderHandle::new(
            reference(),
            Arc::new(Sleepy::new(Duration::from_secs(60), false)),
            Duration::from_secs(1),
        );
        let err = handle.check(check_request()).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Timeout {
                operation: "check",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialized_provider_never_overlaps() {
        let provider = Arc::new(Sleepy::new(Duration::from_millis(10), true));
        let handle = Arc::new(ProviderHandle::new(
            reference(),
            provider.clone(),
            Duration::from_secs(5),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let handle = handle.clone();
            tasks.spawn(async move { handle.check(check_request()).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("join").expect("check");
        }

        assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_provider_overlaps() {
        let provider = Arc::new(Sleepy::new(Duration::from_millis(10), false));
        let handle = Arc::new(ProviderHandle::new(
            reference(),
            provider.clone(),
            Duration::from_secs(5),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let handle = handle.clone();
            tasks.spawn(async move { handle.check(check_request()).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("join").expect("check");
        }

        assert!(provider.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_default_diff_is_unsupported() {
        let handle = ProviderHandle::new(
            reference(),
            Arc::new(Sleepy::new(Duration::ZERO, false)),
            Duration::from_secs(5),
        );
        let err = handle
            .diff(DiffRequest {
                urn: resource_urn(),
                id: "x".to_string(),
                old_inputs: PropertyMap::new(),
                old_outputs: PropertyMap::new(),
                new_inputs: PropertyMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { operation: "diff", .. }));
    }

    #[tokio::test]
    async fn test_create_forwards_to_provider() {
        let mut mock = MockProvider::new();
        mock.expect_info().returning(|| ProviderInfo::new("test"));
        mock.expect_create()
            .withf(|request| request.urn.name() == "a")
            .times(1)
            .returning(|_| {
                Ok(CreateResponse {
                    id: "i-123".to_string(),
                    outputs: PropertyMap::new(),
                })
            });

        let handle = ProviderHandle::new(reference(), Arc::new(mock), Duration::from_secs(5));
        let created = handle
            .create(CreateRequest {
                urn: resource_urn(),
                inputs: PropertyMap::new(),
            })
            .await
            .expect("create");
        assert_eq!(created.id, "i-123");
        assert_eq!(handle.package(), "test");
    }
}
