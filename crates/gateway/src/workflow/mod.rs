//! Multi-step workflows executed through the gateway.

pub mod engine;
pub mod template;

use std::time::Duration;

use async_trait::async_trait;
use conduit_bus::BusError;
use conduit_core::{CoreError, ExecutionContext};
use serde_json::Value;

pub use engine::WorkflowEngine;

/// Source of every event the engine publishes.
pub const WORKFLOW_SOURCE: &str = "workflow-engine";

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {0} is inactive")]
    Inactive(String),

    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("trigger registration failed: {0}")]
    Trigger(#[from] BusError),

    /// Raised by a step while running.
    #[error("{0}")]
    Step(String),
}

impl WorkflowError {
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Finished executions kept for inspection; the oldest go first.
    pub max_retained_executions: usize,
    /// Applies to steps without their own `timeout_ms`.
    pub default_step_timeout: Duration,
    /// Source recorded on requests issued by system steps.
    pub request_source: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retained_executions: 1000,
            default_step_timeout: Duration::from_secs(60),
            request_source: WORKFLOW_SOURCE.to_owned(),
        }
    }
}

/// Handler behind a `custom` step.
#[async_trait]
pub trait CustomStep: Send + Sync {
    /// Run with the step's resolved input; the returned value becomes the
    /// step's raw output.
    async fn run(&self, input: Value, context: &ExecutionContext) -> Result<Value, WorkflowError>;
}
