use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::Payload;
use crate::types::{RequestId, SystemId};

/// Scheduling priority carried by a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Credentials presented with a request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Credential {
    /// A raw API key, looked up by hash.
    ApiKey(String),
    /// A signed bearer token.
    Bearer(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(***)"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// Tracing, scheduling and identity details attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub priority: Priority,
    /// Per-request deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// How many times a transient dispatch failure may be retried.
    #[serde(default)]
    pub retry_budget: u32,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing)]
    pub credential: Option<Credential>,
}

impl Default for RequestMetadata {
    fn default() -> Self {
        let trace = uuid::Uuid::new_v4().simple().to_string();
        Self {
            span_id: trace[..16].to_owned(),
            trace_id: trace,
            priority: Priority::Normal,
            timeout_ms: None,
            retry_budget: 0,
            user_id: None,
            session_id: None,
            tags: HashMap::new(),
            credential: None,
        }
    }
}

/// An abstract operation request entering the gateway.
///
/// Requests are built once with the `with_*` methods and then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// The system that issued the request.
    pub source: SystemId,
    /// Explicit destination; bypasses routing rules when set.
    #[serde(default)]
    pub target: Option<SystemId>,
    /// `"<system>.<action>"` by convention.
    pub operation: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub metadata: RequestMetadata,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Request {
    /// Create a request with a fresh id and default metadata.
    pub fn new(source: impl Into<SystemId>, operation: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: RequestId::generate(),
            source: source.into(),
            target: None,
            operation: operation.into(),
            payload,
            metadata: RequestMetadata::default(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<SystemId>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.metadata.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.metadata.credential = Some(credential);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.metadata.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.metadata.retry_budget = budget;
        self
    }

    /// The system named before the first `.` of the operation, if any.
    pub fn system_prefix(&self) -> Option<&str> {
        self.operation
            .split_once('.')
            .map(|(system, _)| system)
            .filter(|system| !system.is_empty())
    }

    /// The action part of the operation (everything after the first `.`).
    pub fn action(&self) -> &str {
        self.operation
            .split_once('.')
            .map_or(self.operation.as_str(), |(_, action)| action)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.metadata.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Request {
        Request::new("web", "marketplace.search", Payload::Generic(json!({})))
    }

    #[test]
    fn operation_is_split_into_system_and_action() {
        let req = sample();
        assert_eq!(req.system_prefix(), Some("marketplace"));
        assert_eq!(req.action(), "search");
    }

    #[test]
    fn operation_without_dot_has_no_prefix() {
        let req = Request::new("web", "ping", Payload::default());
        assert_eq!(req.system_prefix(), None);
        assert_eq!(req.action(), "ping");
    }

    #[test]
    fn builder_sets_metadata() {
        let req = sample()
            .with_target("cns")
            .with_user("u-1")
            .with_tag("region", "eu")
            .with_timeout(Duration::from_millis(250))
            .with_retry_budget(2)
            .with_priority(Priority::High);

        assert_eq!(req.target.as_deref(), Some("cns"));
        assert_eq!(req.metadata.user_id.as_deref(), Some("u-1"));
        assert_eq!(req.metadata.tags.get("region").map(String::as_str), Some("eu"));
        assert_eq!(req.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(req.metadata.retry_budget, 2);
        assert_eq!(req.metadata.priority, Priority::High);
    }

    #[test]
    fn trace_ids_are_generated() {
        let meta = RequestMetadata::default();
        assert_eq!(meta.trace_id.len(), 32);
        assert_eq!(meta.span_id.len(), 16);
    }

    #[test]
    fn credentials_are_never_serialized() {
        let req = sample().with_credential(Credential::ApiKey("secret".into()));
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("secret"));
        assert_eq!(format!("{:?}", req.metadata.credential), "Some(ApiKey(***))");
    }
}
