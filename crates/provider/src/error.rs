use std::time::Duration;

use thiserror::Error;

/// Errors a backend system can report.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No provider is registered for the system.
    #[error("provider not found: {0}")]
    NotFound(String),

    /// The system processed the request and reported a failure.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The system did not answer in time.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A network or transport-level error occurred.
    #[error("connection error: {0}")]
    Connection(String),

    /// The system is up but refusing work (overloaded, draining).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The provider was given invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The system rejected the request due to its own rate limiting.
    #[error("rate limited")]
    RateLimited,

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProviderError {
    /// Returns `true` if the error is transient and the request may succeed
    /// on retry.
    ///
    /// Failures reported by the system itself count as transient when their
    /// message uses the transient vocabulary, see [`is_transient_message`].
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::Unavailable(_) | Self::RateLimited => {
                true
            }
            Self::ExecutionFailed(msg) => is_transient_message(msg),
            Self::NotFound(_) | Self::Configuration(_) | Self::Serialization(_) => false,
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &["timeout", "timed out", "connection", "unavailable"];

/// Whether an error text describes a transient condition.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}
