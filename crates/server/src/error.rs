use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use conduit_bus::BusError;
use conduit_gateway::{GatewayError, WorkflowError};
use serde_json::json;
use thiserror::Error;

/// Errors raised while starting the server or answering an admin request.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. binding the listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

/// HTTP status for a gateway error code.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
        "AUTHENTICATION_ERROR" => StatusCode::UNAUTHORIZED,
        "UNKNOWN_SYSTEM" => StatusCode::NOT_FOUND,
        "RATE_LIMIT_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
        "SYSTEM_EXECUTION_ERROR" => StatusCode::BAD_GATEWAY,
        "CIRCUIT_OPEN" | "NO_ENDPOINTS" => StatusCode::SERVICE_UNAVAILABLE,
        "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Whole seconds for a `Retry-After` header, rounded up.
pub fn retry_after_secs(millis: u64) -> u64 {
    millis.div_ceil(1000).max(1)
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Gateway(e) => status_for_code(e.code()),
            Self::Workflow(e) => match e {
                WorkflowError::NotFound(_) | WorkflowError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
                WorkflowError::Inactive(_) => StatusCode::CONFLICT,
                WorkflowError::Invalid(_) | WorkflowError::Trigger(_) => StatusCode::BAD_REQUEST,
                WorkflowError::Step(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Bus(e) => match e {
                BusError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
                BusError::DeadLetterNotFound(_) => StatusCode::NOT_FOUND,
                BusError::EmptyEventType
                | BusError::SchemaViolation { .. }
                | BusError::InvalidSchema { .. }
                | BusError::InvalidPattern { .. } => StatusCode::BAD_REQUEST,
            },
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Gateway(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Gateway(e) => json!({ "error": e.to_string(), "code": e.code() }),
            other => json!({ "error": other.to_string() }),
        };
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(after) = self.retry_after() {
            let secs = retry_after_secs(u64::try_from(after.as_millis()).unwrap_or(u64::MAX));
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
