use std::time::Duration;

use conduit_core::{CoreError, ErrorInfo};
use thiserror::Error;

/// Errors raised while processing a request.
///
/// [`Gateway::process_request`](crate::Gateway::process_request) never
/// returns these directly; each one is converted into the [`ErrorInfo`] of
/// an error response.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The request is malformed. Rejected before authentication.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing, invalid or insufficient credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limit exceeded for {identifier} ({limit} requests per window)")]
    RateLimited {
        identifier: String,
        limit: u32,
        retry_after: Duration,
    },

    #[error("circuit open for system {system}")]
    CircuitOpen { system: String, retry_after: Duration },

    #[error("unknown system: {0}")]
    UnknownSystem(String),

    #[error("no endpoints configured for system {0}")]
    NoEndpoints(String),

    /// The downstream system reported a failure.
    #[error("system {system} failed: {message}")]
    SystemExecution {
        system: String,
        message: String,
        retryable: bool,
    },

    #[error("system {system} timed out after {}ms", after.as_millis())]
    Timeout { system: String, after: Duration },

    /// The gateway was misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Stable upper-snake code reported in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::UnknownSystem(_) => "UNKNOWN_SYSTEM",
            Self::NoEndpoints(_) => "NO_ENDPOINTS",
            Self::SystemExecution { .. } => "SYSTEM_EXECUTION_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::CircuitOpen { .. } | Self::Timeout { .. } => true,
            Self::SystemExecution { retryable, .. } => *retryable,
            Self::Validation(_)
            | Self::Authentication(_)
            | Self::UnknownSystem(_)
            | Self::NoEndpoints(_)
            | Self::Configuration(_) => false,
        }
    }

    /// How long the caller should wait before trying again, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.code(), self.to_string(), self.is_retryable());
        match self.retry_after() {
            Some(after) => info.with_retry_after_ms(u64::try_from(after.as_millis()).unwrap_or(u64::MAX)),
            None => info,
        }
    }
}

impl From<CoreError> for GatewayError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}
