use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventId, ExecutionId, SystemId, WorkflowId};

/// Versioning and correlation details of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            version: default_version(),
            workflow_id: None,
            execution_id: None,
            step_id: None,
            correlation_id: None,
        }
    }
}

impl EventMetadata {
    /// Metadata correlating an event with a workflow execution.
    pub fn for_execution(workflow_id: WorkflowId, execution_id: ExecutionId) -> Self {
        Self {
            correlation_id: Some(execution_id.to_string()),
            workflow_id: Some(workflow_id),
            execution_id: Some(execution_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// A published fact. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: SystemId,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<SystemId>, payload: Value) -> Self {
        Self {
            id: EventId::generate(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
            metadata: EventMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
