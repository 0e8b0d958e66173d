use thiserror::Error;

/// Errors returned by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event queue is full ({capacity} events)")]
    QueueFull { capacity: usize },

    #[error("event type must not be empty")]
    EmptyEventType,

    #[error("event '{event_type}' violates its schema: {reason}")]
    SchemaViolation { event_type: String, reason: String },

    #[error("invalid schema for '{event_type}': {reason}")]
    InvalidSchema { event_type: String, reason: String },

    #[error("invalid subscription pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(String),
}

/// A failure reported by an event handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}
