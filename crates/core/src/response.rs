use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RequestId, SystemId};

/// Final status of a processed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
}

/// Structured error carried by a non-successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable upper-snake error code, e.g. `RATE_LIMIT_EXCEEDED`.
    pub code: String,
    pub message: String,
    /// Whether the caller may retry the same request.
    pub retryable: bool,
    /// Suggested wait before retrying, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
        }
    }

    #[must_use]
    pub fn with_retry_after_ms(mut self, millis: u64) -> Self {
        self.retry_after_ms = Some(millis);
        self
    }
}

/// Processing details attached to every response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
    /// Load score of the endpoint that served the request, in `[0, 1]`.
    pub system_load: f64,
    pub cache_hit: bool,
    /// The endpoint that served the request, when one was selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Names of the transformation stages applied to the data, in order.
    #[serde(default)]
    pub transformation_trace: Vec<String>,
}

impl ResponseMetadata {
    fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            processing_time_ms: 0,
            system_load: 0.0,
            cache_hit: false,
            endpoint: None,
            transformation_trace: Vec::new(),
        }
    }
}

/// Normalized response returned for every request, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub request_id: RequestId,
    /// The system that produced the response (the gateway itself for
    /// requests rejected before routing).
    pub source: SystemId,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub metadata: ResponseMetadata,
}

impl Response {
    pub fn success(request_id: RequestId, source: SystemId, data: Value) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            request_id,
            source,
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
            metadata: ResponseMetadata::now(),
        }
    }

    pub fn error(request_id: RequestId, source: SystemId, error: ErrorInfo) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            request_id,
            source,
            status: ResponseStatus::Error,
            data: None,
            error: Some(error),
            metadata: ResponseMetadata::now(),
        }
    }

    pub fn timeout(request_id: RequestId, source: SystemId, error: ErrorInfo) -> Self {
        Self {
            status: ResponseStatus::Timeout,
            ..Self::error(request_id, source, error)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// The error code, if this is an error or timeout response.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn success_carries_data_only() {
        let resp = Response::success("r-1".into(), "cns".into(), json!({"ok": true}));
        assert!(resp.is_success());
        assert!(resp.error.is_none());
        assert_eq!(resp.data, Some(json!({"ok": true})));
    }

    #[test]
    fn timeout_is_an_error_with_its_own_status() {
        let info = ErrorInfo::new("TIMEOUT", "too slow", true);
        let resp = Response::timeout("r-1".into(), "cns".into(), info);
        assert_eq!(resp.status, ResponseStatus::Timeout);
        assert_eq!(resp.error_code(), Some("TIMEOUT"));
        assert!(resp.data.is_none());
    }

    #[test]
    fn serializes_status_in_snake_case() {
        let info = ErrorInfo::new("RATE_LIMIT_EXCEEDED", "slow down", true).with_retry_after_ms(900);
        let resp = Response::error("r-2".into(), "gateway".into(), info);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["retry_after_ms"], 900);
        assert!(json.get("data").is_none());
    }
}
