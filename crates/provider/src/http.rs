use std::collections::HashMap;
use std::time::Duration;

use conduit_core::Request;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::error::ProviderError;
use crate::provider::Provider;

/// A provider that posts requests as JSON to `<endpoint>/<operation>`.
///
/// Liveness probes issue `GET <endpoint>/health`. Feature-gated behind
/// `http`.
pub struct HttpProvider {
    name: String,
    client: Client,
    headers: HashMap<String, String>,
}

impl HttpProvider {
    /// Create a provider with a default `reqwest::Client` and no extra headers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            headers: HashMap::new(),
        }
    }

    /// Use a custom client (timeouts, TLS, proxies).
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Headers sent with every request.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

fn classify(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(Duration::ZERO)
    } else if err.is_connect() {
        ProviderError::Connection(err.to_string())
    } else {
        ProviderError::ExecutionFailed(err.to_string())
    }
}

impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &Request, endpoint: &str) -> Result<Value, ProviderError> {
        let body = serde_json::json!({
            "request_id": request.id,
            "source": request.source,
            "operation": request.operation,
            "payload": request.payload.to_value(),
            "trace_id": request.metadata.trace_id,
            "tags": request.metadata.tags,
        });

        let mut outbound = self
            .client
            .post(Self::url(endpoint, &request.operation))
            .header("x-trace-id", &request.metadata.trace_id)
            .json(&body);
        if let Some(timeout) = request.timeout() {
            outbound = outbound.timeout(timeout);
        }
        for (key, value) in &self.headers {
            outbound = outbound.header(key, value);
        }

        let response = outbound.send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        let data: Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({"status_code": status.as_u16()}));

        match status {
            s if s.is_success() => Ok(data),
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited),
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                Err(ProviderError::Unavailable(format!("{status}: {data}")))
            }
            StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
                Err(ProviderError::ExecutionFailed(format!("upstream timeout ({status})")))
            }
            _ => Err(ProviderError::ExecutionFailed(format!("{status}: {data}"))),
        }
    }

    async fn health_check(&self, endpoint: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(Self::url(endpoint, "health"))
            .send()
            .await
            .map_err(|e| classify(&e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::Unavailable(format!(
                "health probe returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_endpoint_and_operation() {
        assert_eq!(
            HttpProvider::url("http://cns:8080/", "cns.validate"),
            "http://cns:8080/cns.validate"
        );
        assert_eq!(HttpProvider::url("http://cns:8080", "/health"), "http://cns:8080/health");
    }

    #[test]
    fn with_headers() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".into(), "Bearer abc".into());
        let provider = HttpProvider::new("cns").with_headers(headers);
        assert_eq!(provider.headers.len(), 1);
        assert_eq!(Provider::name(&provider), "cns");
    }

    #[test]
    fn with_custom_client() {
        let client = Client::builder().timeout(Duration::from_secs(10)).build().unwrap();
        let provider = HttpProvider::new("bytestar").with_client(client);
        assert_eq!(Provider::name(&provider), "bytestar");
    }
}
