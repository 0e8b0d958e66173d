use thiserror::Error;

/// Errors raised while constructing or validating core data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A request failed structural validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A payload does not fit the operation it was sent to.
    #[error("invalid payload for {operation}: {reason}")]
    InvalidPayload {
        /// The operation the payload was addressed to.
        operation: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A workflow definition is inconsistent.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
