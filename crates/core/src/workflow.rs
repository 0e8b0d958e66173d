use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::path;
use crate::types::{ExecutionId, SystemId, WorkflowId};

/// Whether a registered workflow accepts new executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Inactive,
}

/// What starts a workflow besides an explicit call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Started only through `execute_workflow`.
    Manual,
    /// Started whenever an event matching `pattern` is published; the event
    /// payload becomes the workflow input.
    Event { pattern: String },
}

/// Step flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// One gateway request.
    SystemCall,
    /// Evaluate conditions over the resolved input.
    Conditional,
    /// Several gateway requests at once, best effort.
    Parallel,
    /// A named handler registered with the engine.
    Custom,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemCall => f.write_str("system-call"),
            Self::Conditional => f.write_str("conditional"),
            Self::Parallel => f.write_str("parallel"),
            Self::Custom => f.write_str("custom"),
        }
    }
}

/// Comparison operators available to conditional steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Exists,
    Regex,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Exists => "exists",
            Self::Regex => "regex",
        };
        f.write_str(s)
    }
}

/// One check of a conditional step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the step's resolved input.
    pub field: String,
    pub operator: ConditionOperator,
    /// Comparison operand; ignored by `exists`.
    #[serde(default)]
    pub value: Value,
    #[serde(skip)]
    pattern: PatternCache,
}

/// The compiled `regex` operand, keyed by its source so edits to `value`
/// are never answered from a stale entry.
#[derive(Debug, Clone, Default)]
struct PatternCache(OnceLock<(String, Option<Regex>)>);

impl PatternCache {
    fn is_match(&self, pattern: &str, text: &str) -> bool {
        let (source, compiled) = self
            .0
            .get_or_init(|| (pattern.to_owned(), Regex::new(pattern).ok()));
        if source == pattern {
            compiled.as_ref().is_some_and(|re| re.is_match(text))
        } else {
            Regex::new(pattern).is_ok_and(|re| re.is_match(text))
        }
    }
}

impl PartialEq for PatternCache {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            pattern: PatternCache::default(),
        }
    }

    /// Compile a `regex` operand and keep it for later evaluations.
    fn compile_pattern(&self) -> Result<(), regex::Error> {
        let pattern = self.value.as_str().unwrap_or_default();
        let compiled = Regex::new(pattern)?;
        // An earlier evaluation may have filled the cache already.
        let _ = self.pattern.0.set((pattern.to_owned(), Some(compiled)));
        Ok(())
    }

    /// Evaluate against `input`. Missing fields fail every operator.
    pub fn evaluate(&self, input: &Value) -> bool {
        let Some(actual) = path::lookup(input, &self.field) else {
            return false;
        };
        match self.operator {
            ConditionOperator::Exists => !actual.is_null(),
            ConditionOperator::Eq => loosely_equal(actual, &self.value),
            ConditionOperator::Ne => !loosely_equal(actual, &self.value),
            ConditionOperator::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            ConditionOperator::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            ConditionOperator::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            ConditionOperator::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            ConditionOperator::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| loosely_equal(actual, o)),
                Value::String(haystack) => actual.as_str().is_some_and(|s| haystack.contains(s)),
                _ => false,
            },
            ConditionOperator::Regex => match (actual.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => self.pattern.is_match(pattern, text),
                _ => false,
            },
        }
    }

    fn describe(&self) -> String {
        if self.operator == ConditionOperator::Exists {
            format!("{} exists", self.field)
        } else {
            format!("{} {} {}", self.field, self.operator, self.value)
        }
    }
}

/// Evaluate `conditions` in order; all must hold.
///
/// Returns the verdict and a human-readable reason naming the first failed
/// condition, or summarizing success.
pub fn evaluate_conditions(conditions: &[Condition], input: &Value) -> (bool, String) {
    for condition in conditions {
        if !condition.evaluate(input) {
            return (false, format!("condition failed: {}", condition.describe()));
        }
    }
    (true, format!("all {} conditions passed", conditions.len()))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers compare numerically even when one side arrived as a string, since
/// template substitution can stringify values.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) if a.is_number() || b.is_number() => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Retry budget of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRetry {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Pause between attempts.
    #[serde(default)]
    pub delay_ms: u64,
}

/// One branch of a parallel step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelTask {
    pub id: String,
    #[serde(default)]
    pub system: Option<SystemId>,
    pub operation: String,
    #[serde(default)]
    pub input: Map<String, Value>,
}

/// A unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Explicit target system; the router decides when absent.
    #[serde(default)]
    pub system: Option<SystemId>,
    #[serde(default)]
    pub operation: Option<String>,
    /// Input template mapping; string values may contain placeholders.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Output template mapping, resolved with `previous` bound to this step's
    /// raw result.
    #[serde(default)]
    pub output: Map<String, Value>,
    /// Merge the mapped output into the workflow variables.
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// End the execution when a conditional step evaluates to false.
    #[serde(default)]
    pub halt_on_false: bool,
    #[serde(default)]
    pub tasks: Vec<ParallelTask>,
    /// Name of the custom handler for `custom` steps.
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub retry: Option<StepRetry>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    fn base(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            system: None,
            operation: None,
            input: Map::new(),
            output: Map::new(),
            persist: false,
            conditions: Vec::new(),
            halt_on_false: false,
            tasks: Vec::new(),
            handler: None,
            retry: None,
            timeout_ms: None,
        }
    }

    /// A step that sends `operation` through the gateway.
    pub fn system_call(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::base(id, StepKind::SystemCall)
        }
    }

    pub fn conditional(id: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            conditions,
            ..Self::base(id, StepKind::Conditional)
        }
    }

    pub fn parallel(id: impl Into<String>, tasks: Vec<ParallelTask>) -> Self {
        Self {
            tasks,
            ..Self::base(id, StepKind::Parallel)
        }
    }

    pub fn custom(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            handler: Some(handler.into()),
            ..Self::base(id, StepKind::Custom)
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<SystemId>) -> Self {
        self.system = Some(system.into());
        self
    }

    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, template: impl Into<Value>) -> Self {
        self.input.insert(key.into(), template.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, template: impl Into<Value>) -> Self {
        self.output.insert(key.into(), template.into());
        self
    }

    #[must_use]
    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    #[must_use]
    pub fn halting_on_false(mut self) -> Self {
        self.halt_on_false = true;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(StepRetry {
            max_attempts,
            delay_ms,
        });
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Total attempts this step may take.
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }
}

/// A reusable multi-step definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_workflow_version")]
    pub version: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Default variables, visible as `workflow.variables.*`.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub status: WorkflowStatus,
}

fn default_workflow_version() -> String {
    "1.0.0".to_owned()
}

impl Workflow {
    pub fn new(id: impl Into<WorkflowId>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            version: default_workflow_version(),
            steps: Vec::new(),
            triggers: Vec::new(),
            variables: Map::new(),
            status: WorkflowStatus::Active,
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Check structural consistency: unique step ids and the fields each
    /// step kind needs.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |msg: String| Err(CoreError::InvalidWorkflow(format!("{}: {msg}", self.id)));

        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidWorkflow("workflow id must not be empty".into()));
        }
        if self.steps.is_empty() {
            return invalid("workflow has no steps".into());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return invalid(format!("duplicate step id '{}'", step.id));
            }
            if step.retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
                return invalid(format!("step '{}' has retry.max_attempts = 0", step.id));
            }
            match step.kind {
                StepKind::SystemCall if step.operation.as_deref().is_none_or(str::is_empty) => {
                    return invalid(format!("system-call step '{}' has no operation", step.id));
                }
                StepKind::Conditional if step.conditions.is_empty() => {
                    return invalid(format!("conditional step '{}' has no conditions", step.id));
                }
                StepKind::Parallel if step.tasks.is_empty() => {
                    return invalid(format!("parallel step '{}' has no tasks", step.id));
                }
                StepKind::Custom if step.handler.is_none() => {
                    return invalid(format!("custom step '{}' names no handler", step.id));
                }
                _ => {}
            }
            for condition in &step.conditions {
                if condition.operator == ConditionOperator::Regex
                    && let Err(e) = condition.compile_pattern()
                {
                    return invalid(format!("step '{}': bad regex: {e}", step.id));
                }
            }
        }
        Ok(())
    }
}

/// Lifecycle of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Values visible to templates during an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// The input the execution was started with (`workflow.input.*`).
    pub input: Value,
    /// Workflow defaults plus persisted step outputs (`workflow.variables.*`).
    pub variables: Map<String, Value>,
    /// Output of every finished step by id (`steps.<id>.*`).
    pub steps: Map<String, Value>,
    /// Output of the most recently finished step (`previous.*`).
    pub previous: Value,
}

impl ExecutionContext {
    pub fn new(input: Value, variables: Map<String, Value>) -> Self {
        Self {
            input,
            variables,
            steps: Map::new(),
            previous: Value::Null,
        }
    }

    /// Record a finished step's output, making it the new `previous`.
    pub fn record_step(&mut self, step_id: &str, output: Value) {
        self.steps.insert(step_id.to_owned(), output.clone());
        self.previous = output;
    }

    /// Merge an object's entries into the variables; other values are ignored.
    pub fn persist(&mut self, output: &Value) {
        if let Value::Object(map) = output {
            for (key, value) in map {
                self.variables.insert(key.clone(), value.clone());
            }
        }
    }
}

/// State of one run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    /// Index of the step being (or last) executed.
    pub current_step: usize,
    pub context: ExecutionContext,
    pub step_results: Vec<StepRecord>,
    pub errors: Vec<String>,
    /// Correlation metadata supplied by the caller.
    pub metadata: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(
        workflow: &Workflow,
        input: Value,
        metadata: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::generate(),
            workflow_id: workflow.id.clone(),
            status: ExecutionStatus::Pending,
            current_step: 0,
            context: ExecutionContext::new(input, workflow.variables.clone()),
            step_results: Vec::new(),
            errors: Vec::new(),
            metadata,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The record of `step_id`, if it has finished.
    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }
}
