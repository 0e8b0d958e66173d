use async_trait::async_trait;
use conduit_core::Request;
use serde_json::Value;

use crate::error::ProviderError;

/// A backend system reachable through one or more endpoints.
///
/// This trait uses native `async fn` and is therefore not object-safe. Use
/// [`DynProvider`] behind `Arc`; every `Provider` implements it through a
/// blanket implementation.
pub trait Provider: Send + Sync {
    /// Name of the system this provider talks to.
    fn name(&self) -> &str;

    /// Send `request` to `endpoint` and return the system's result data.
    fn execute(
        &self,
        request: &Request,
        endpoint: &str,
    ) -> impl std::future::Future<Output = Result<Value, ProviderError>> + Send;

    /// Probe `endpoint` for liveness.
    fn health_check(
        &self,
        endpoint: &str,
    ) -> impl std::future::Future<Output = Result<(), ProviderError>> + Send;
}

/// Object-safe provider trait for use behind `Arc<dyn DynProvider>`.
#[async_trait]
pub trait DynProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: &Request, endpoint: &str) -> Result<Value, ProviderError>;

    async fn health_check(&self, endpoint: &str) -> Result<(), ProviderError>;
}

#[async_trait]
impl<T: Provider + Sync> DynProvider for T {
    fn name(&self) -> &str {
        Provider::name(self)
    }

    async fn execute(&self, request: &Request, endpoint: &str) -> Result<Value, ProviderError> {
        Provider::execute(self, request, endpoint).await
    }

    async fn health_check(&self, endpoint: &str) -> Result<(), ProviderError> {
        Provider::health_check(self, endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conduit_core::Payload;

    use super::*;

    struct MockProvider {
        name: String,
        should_fail: bool,
    }

    impl MockProvider {
        fn new(name: &str, should_fail: bool) -> Self {
            Self {
                name: name.to_owned(),
                should_fail,
            }
        }
    }

    impl Provider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _request: &Request, endpoint: &str) -> Result<Value, ProviderError> {
            if self.should_fail {
                return Err(ProviderError::ExecutionFailed("mock failure".into()));
            }
            Ok(serde_json::json!({"endpoint": endpoint}))
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            if self.should_fail {
                return Err(ProviderError::Connection("mock unhealthy".into()));
            }
            Ok(())
        }
    }

    fn request() -> Request {
        Request::new("test", "cns.validate", Payload::default())
    }

    #[tokio::test]
    async fn provider_execute_success() {
        let provider = MockProvider::new("cns", false);
        let data = Provider::execute(&provider, &request(), "http://a").await.unwrap();
        assert_eq!(data["endpoint"], "http://a");
    }

    #[tokio::test]
    async fn provider_execute_failure() {
        let provider = MockProvider::new("cns", true);
        let err = Provider::execute(&provider, &request(), "http://a").await.unwrap_err();
        assert!(matches!(err, ProviderError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn blanket_dyn_provider_impl() {
        let provider: Arc<dyn DynProvider> = Arc::new(MockProvider::new("cns", false));
        assert_eq!(provider.name(), "cns");
        provider.execute(&request(), "http://b").await.unwrap();
        provider.health_check("http://b").await.unwrap();
    }

    #[tokio::test]
    async fn dyn_provider_health_check_failure() {
        let provider: Arc<dyn DynProvider> = Arc::new(MockProvider::new("sick", true));
        let err = provider.health_check("http://c").await.unwrap_err();
        assert!(matches!(err, ProviderError::Connection(_)));
    }
}
