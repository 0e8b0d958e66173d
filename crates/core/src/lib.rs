pub mod auth;
pub mod clock;
pub mod error;
pub mod event;
pub mod path;
pub mod payload;
pub mod request;
pub mod response;
pub mod types;
pub mod workflow;

pub use auth::{AuthContext, AuthMethod, required_permission};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use event::{Event, EventMetadata};
pub use payload::{
    GenerationPayload, Payload, PayloadKind, PurchasePayload, SearchPayload, ValidationPayload,
};
pub use request::{Credential, Priority, Request, RequestMetadata};
pub use response::{ErrorInfo, Response, ResponseMetadata, ResponseStatus};
pub use types::{EventId, ExecutionId, HandlerId, RequestId, SystemId, WorkflowId};
pub use workflow::{
    Condition, ConditionOperator, ExecutionContext, ExecutionStatus, ParallelTask, Step,
    StepKind, StepRecord, StepRetry, StepStatus, Trigger, Workflow, WorkflowExecution,
    WorkflowStatus, evaluate_conditions,
};
