use conduit_core::Request;
use serde_json::Value;
use tracing::info;

use crate::error::ProviderError;
use crate::provider::Provider;

/// A provider that logs the request and echoes it back without any I/O.
///
/// Stands in for a real backend during local development and tests.
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Provider for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &Request, endpoint: &str) -> Result<Value, ProviderError> {
        info!(
            system = %self.name,
            request_id = %request.id,
            operation = %request.operation,
            endpoint = %endpoint,
            "echo provider handled request"
        );
        Ok(serde_json::json!({
            "system": self.name,
            "operation": request.operation,
            "endpoint": endpoint,
            "echo": request.payload.to_value(),
        }))
    }

    #[allow(clippy::unused_async)]
    async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}
