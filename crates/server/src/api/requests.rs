use std::collections::HashMap;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use conduit_core::{Payload, Priority, Request};
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use super::auth::credential_from;
use crate::error::{ServerError, retry_after_secs, status_for_code};

/// Body of `POST /v1/requests`.
///
/// `payload` is untyped JSON, decoded into the shape `operation` expects.
#[derive(Debug, Deserialize)]
pub struct RequestBody {
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_budget: u32,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

fn default_source() -> String {
    "http".to_owned()
}

impl RequestBody {
    fn into_request(self, headers: &HeaderMap) -> Result<Request, ServerError> {
        let payload = Payload::from_operation(&self.operation, self.payload)
            .map_err(|e| ServerError::BadRequest(e.to_string()))?;
        let mut request = Request::new(self.source, self.operation, payload)
            .with_priority(self.priority)
            .with_retry_budget(self.retry_budget);
        request.metadata.tags = self.tags;
        if let Some(target) = self.target {
            request = request.with_target(target);
        }
        if let Some(ms) = self.timeout_ms {
            request = request.with_timeout(Duration::from_millis(ms));
        }
        if let Some(user) = self.user_id {
            request = request.with_user(user);
        }
        if let Some(session) = self.session_id {
            request = request.with_session(session);
        }
        if let Some(credential) = credential_from(headers) {
            request = request.with_credential(credential);
        }
        Ok(request)
    }
}

/// `POST /v1/requests`: run one request through the gateway pipeline.
///
/// The body is always the normalized response; the HTTP status mirrors its
/// error code.
pub async fn process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RequestBody>,
) -> Result<Response, ServerError> {
    let request = body.into_request(&headers)?;
    let response = state.runtime.gateway().process_request(&request).await;

    let status = response.error_code().map_or(StatusCode::OK, status_for_code);
    let retry_after = response.error.as_ref().and_then(|e| e.retry_after_ms);
    let mut http = (status, Json(response)).into_response();
    if let Some(ms) = retry_after {
        http.headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(ms)));
    }
    Ok(http)
}
