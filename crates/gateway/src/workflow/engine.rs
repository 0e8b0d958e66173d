use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_bus::{EventBus, EventHandler, HandlerError, SubscribeOptions, Subscription};
use conduit_core::{
    Clock, Credential, Event, EventMetadata, ExecutionContext, ExecutionId, ExecutionStatus, Payload, Request,
    Step, StepKind, StepRecord, StepStatus, SystemId, Trigger, Workflow, WorkflowExecution, WorkflowId,
    WorkflowStatus, evaluate_conditions,
};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::template;
use super::{CustomStep, WORKFLOW_SOURCE, WorkflowConfig, WorkflowError};
use crate::gateway::Gateway;

/// Who an execution runs as and how its requests are tagged.
#[derive(Clone)]
struct Correlation {
    workflow_id: WorkflowId,
    execution_id: ExecutionId,
    user_id: Option<String>,
    credential: Option<Credential>,
}

/// What a step produced before output mapping.
struct StepOutcome {
    output: Value,
    /// A negative conditional asked to end the execution.
    halt: bool,
}

impl StepOutcome {
    fn output(output: Value) -> Self {
        Self { output, halt: false }
    }
}

struct Inner {
    gateway: Arc<Gateway>,
    bus: Option<EventBus>,
    clock: Arc<dyn Clock>,
    config: WorkflowConfig,
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
    executions: DashMap<ExecutionId, WorkflowExecution>,
    finished: Mutex<VecDeque<ExecutionId>>,
    handlers: RwLock<HashMap<String, Arc<dyn CustomStep>>>,
    triggers: Mutex<HashMap<WorkflowId, Vec<Subscription>>>,
    tracker: TaskTracker,
}

/// Runs registered workflows, one background task per execution.
///
/// Steps of one execution run strictly in order; executions are independent
/// of each other. Every system step goes through
/// [`Gateway::process_request`], so routing, limits and breakers apply to
/// workflow traffic exactly as to ingress traffic.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<Inner>,
}

impl WorkflowEngine {
    /// Build an engine on top of `gateway`. Lifecycle events go to the
    /// gateway's event bus, when it has one.
    pub fn new(gateway: Arc<Gateway>, config: WorkflowConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus: gateway.event_bus().cloned(),
                clock: Arc::clone(gateway.clock()),
                gateway,
                config,
                workflows: RwLock::new(HashMap::new()),
                executions: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                handlers: RwLock::new(HashMap::new()),
                triggers: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    /// Register (or replace) a workflow. Event triggers are subscribed on
    /// the bus; triggers of a replaced definition are cancelled.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        workflow.validate()?;
        let workflow = Arc::new(workflow);

        let mut subscriptions = Vec::new();
        for trigger in &workflow.triggers {
            let Trigger::Event { pattern } = trigger else {
                continue;
            };
            let Some(bus) = &self.inner.bus else {
                warn!(workflow_id = %workflow.id, pattern, "event trigger ignored, no event bus configured");
                continue;
            };
            let handler = Arc::new(TriggerHandler {
                engine: Arc::downgrade(&self.inner),
                workflow_id: workflow.id.clone(),
            });
            match bus.subscribe(pattern, handler, SubscribeOptions::default()) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    for s in &subscriptions {
                        s.cancel();
                    }
                    return Err(e.into());
                }
            }
        }

        if let Some(previous) = self
            .inner
            .triggers
            .lock()
            .insert(workflow.id.clone(), subscriptions)
        {
            for s in previous {
                s.cancel();
            }
        }
        info!(
            workflow_id = %workflow.id,
            version = %workflow.version,
            steps = workflow.steps.len(),
            "workflow registered"
        );
        self.inner
            .workflows
            .write()
            .insert(workflow.id.clone(), workflow);
        Ok(())
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.inner.workflows.read().get(workflow_id).cloned()
    }

    pub fn workflows(&self) -> Vec<Arc<Workflow>> {
        let mut all: Vec<_> = self.inner.workflows.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Register the handler for `custom` steps naming `name`.
    pub fn register_step_handler(&self, name: impl Into<String>, handler: Arc<dyn CustomStep>) {
        self.inner.handlers.write().insert(name.into(), handler);
    }

    /// Start an execution and return its id immediately; the steps run in
    /// the background.
    pub fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        metadata: HashMap<String, String>,
    ) -> Result<ExecutionId, WorkflowError> {
        self.inner.start(workflow_id, input, metadata, None)
    }

    /// Like [`execute_workflow`](Self::execute_workflow), authenticating every
    /// system step with `credential`.
    pub fn execute_workflow_as(
        &self,
        workflow_id: &str,
        input: Value,
        metadata: HashMap<String, String>,
        credential: Credential,
    ) -> Result<ExecutionId, WorkflowError> {
        self.inner.start(workflow_id, input, metadata, Some(credential))
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.inner
            .executions
            .get(execution_id)
            .map(|e| e.value().clone())
    }

    /// Executions, oldest first, optionally only those of one workflow.
    pub fn list_executions(&self, workflow_id: Option<&str>) -> Vec<WorkflowExecution> {
        let mut executions: Vec<WorkflowExecution> = self
            .inner
            .executions
            .iter()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id.as_str() == id))
            .map(|e| e.value().clone())
            .collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        executions
    }

    /// Mark a running execution cancelled. The current step is not
    /// interrupted; its result is discarded when it completes.
    ///
    /// Returns `false` when the execution had already finished.
    pub fn cancel_execution(&self, execution_id: &str) -> Result<bool, WorkflowError> {
        let now = self.inner.clock.utc();
        let workflow_id = {
            let mut execution = self
                .inner
                .executions
                .get_mut(execution_id)
                .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_owned()))?;
            if execution.status.is_terminal() {
                return Ok(false);
            }
            execution.status = ExecutionStatus::Cancelled;
            execution.updated_at = now;
            execution.completed_at = Some(now);
            execution.workflow_id.clone()
        };

        let execution_id = ExecutionId::from(execution_id);
        info!(workflow_id = %workflow_id, execution_id = %execution_id, "workflow execution cancelled");
        self.inner.publish(
            "workflow.cancelled",
            EventMetadata::for_execution(workflow_id, execution_id.clone()),
            json!({}),
        );
        self.inner.finish(&execution_id);
        Ok(true)
    }

    /// Executions not yet finished.
    pub fn active_count(&self) -> usize {
        self.inner
            .executions
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    /// Drop event triggers and wait for in-flight executions.
    pub async fn shutdown(&self) {
        for (_, subscriptions) in self.inner.triggers.lock().drain() {
            for s in subscriptions {
                s.cancel();
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("workflow engine stopped");
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.inner.workflows.read().len())
            .field("executions", &self.inner.executions.len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn start(
        self: &Arc<Self>,
        workflow_id: &str,
        input: Value,
        metadata: HashMap<String, String>,
        credential: Option<Credential>,
    ) -> Result<ExecutionId, WorkflowError> {
        let workflow = self
            .workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_owned()))?;
        if workflow.status == WorkflowStatus::Inactive {
            return Err(WorkflowError::Inactive(workflow_id.to_owned()));
        }

        let execution = WorkflowExecution::new(&workflow, input, metadata, self.clock.utc());
        let correlation = Correlation {
            workflow_id: workflow.id.clone(),
            execution_id: execution.id.clone(),
            user_id: execution.metadata.get("user_id").cloned(),
            credential,
        };
        let id = execution.id.clone();
        self.executions.insert(id.clone(), execution);

        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            inner.run(workflow, correlation).await;
        });
        Ok(id)
    }

    #[instrument(
        name = "workflow.execute",
        skip_all,
        fields(workflow_id = %workflow.id, execution_id = %correlation.execution_id)
    )]
    async fn run(&self, workflow: Arc<Workflow>, correlation: Correlation) {
        let id = &correlation.execution_id;
        let started = self.update(id, |execution| {
            if execution.status != ExecutionStatus::Pending {
                return false;
            }
            execution.status = ExecutionStatus::Running;
            true
        });
        if started != Some(true) {
            return;
        }
        self.publish("workflow.started", self.metadata(&correlation, None), json!({}));
        info!("workflow execution started");

        for (index, step) in workflow.steps.iter().enumerate() {
            let context = self
                .update(id, |execution| {
                    (execution.status == ExecutionStatus::Running).then(|| {
                        execution.current_step = index;
                        execution.context.clone()
                    })
                })
                .flatten();
            let Some(context) = context else {
                debug!(step_id = %step.id, "execution no longer running");
                return;
            };

            let (result, attempts) = self.run_with_retries(step, &context, &correlation).await;

            // Each result is applied only while the execution is still running,
            // checked under the same entry lock that applies it.
            let now = self.clock.utc();
            match result {
                Ok(outcome) => {
                    let output = map_output(step, &context, outcome.output);
                    let recorded = self.update(id, |execution| {
                        if execution.status != ExecutionStatus::Running {
                            return false;
                        }
                        execution.context.record_step(&step.id, output.clone());
                        if step.persist {
                            execution.context.persist(&output);
                        }
                        execution.step_results.push(StepRecord {
                            step_id: step.id.clone(),
                            status: StepStatus::Completed,
                            attempts,
                            output: Some(output.clone()),
                            error: None,
                            finished_at: now,
                        });
                        true
                    });
                    if recorded != Some(true) {
                        debug!(step_id = %step.id, "discarding step result of cancelled execution");
                        return;
                    }
                    debug!(step_id = %step.id, kind = %step.kind, attempts, "workflow step completed");
                    self.publish(
                        "workflow.step.completed",
                        self.metadata(&correlation, Some(&step.id)),
                        json!({"step_id": step.id, "attempts": attempts, "output": output}),
                    );

                    if outcome.halt {
                        info!(step_id = %step.id, "conditional step ended the execution");
                        self.update(id, |execution| {
                            if execution.status == ExecutionStatus::Running {
                                skip_remaining(execution, &workflow, index + 1, now);
                            }
                        });
                        break;
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    let failed = self.update(id, |execution| {
                        if execution.status != ExecutionStatus::Running {
                            return false;
                        }
                        execution.step_results.push(StepRecord {
                            step_id: step.id.clone(),
                            status: StepStatus::Failed,
                            attempts,
                            output: None,
                            error: Some(message.clone()),
                            finished_at: now,
                        });
                        execution.errors.push(format!("step {}: {message}", step.id));
                        skip_remaining(execution, &workflow, index + 1, now);
                        execution.status = ExecutionStatus::Failed;
                        execution.completed_at = Some(now);
                        true
                    });
                    if failed != Some(true) {
                        debug!(step_id = %step.id, "discarding step failure of cancelled execution");
                        return;
                    }
                    warn!(step_id = %step.id, attempts, error = %message, "workflow execution failed");
                    self.publish(
                        "workflow.step.failed",
                        self.metadata(&correlation, Some(&step.id)),
                        json!({"step_id": step.id, "attempts": attempts, "error": message}),
                    );
                    self.publish(
                        "workflow.failed",
                        self.metadata(&correlation, None),
                        json!({"failed_step": step.id, "error": message}),
                    );
                    self.finish(id);
                    return;
                }
            }
        }

        let now = self.clock.utc();
        let completed = self.update(id, |execution| {
            if execution.status != ExecutionStatus::Running {
                return None;
            }
            execution.status = ExecutionStatus::Completed;
            execution.completed_at = Some(now);
            Some(Value::Object(execution.context.steps.clone()))
        });
        if let Some(Some(outputs)) = completed {
            info!("workflow execution completed");
            self.publish(
                "workflow.completed",
                self.metadata(&correlation, None),
                json!({"steps": outputs}),
            );
            self.finish(id);
        }
    }

    async fn run_with_retries(
        &self,
        step: &Step,
        context: &ExecutionContext,
        correlation: &Correlation,
    ) -> (Result<StepOutcome, WorkflowError>, u32) {
        let max_attempts = step.max_attempts();
        let mut attempt = 1;
        loop {
            match self.run_step_timed(step, context, correlation).await {
                Ok(outcome) => return (Ok(outcome), attempt),
                Err(e) if attempt < max_attempts && self.is_running(&correlation.execution_id) => {
                    warn!(
                        step_id = %step.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "workflow step failed, retrying"
                    );
                    let delay = step.retry.as_ref().map_or(0, |r| r.delay_ms);
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    async fn run_step_timed(
        &self,
        step: &Step,
        context: &ExecutionContext,
        correlation: &Correlation,
    ) -> Result<StepOutcome, WorkflowError> {
        let limit = step
            .timeout_ms
            .map_or(self.config.default_step_timeout, Duration::from_millis);
        tokio::time::timeout(limit, self.run_step(step, context, correlation))
            .await
            .unwrap_or_else(|_| {
                Err(WorkflowError::step(format!(
                    "step timed out after {}ms",
                    limit.as_millis()
                )))
            })
    }

    async fn run_step(
        &self,
        step: &Step,
        context: &ExecutionContext,
        correlation: &Correlation,
    ) -> Result<StepOutcome, WorkflowError> {
        let input = Value::Object(template::resolve_map(&step.input, context));
        match step.kind {
            StepKind::SystemCall => {
                let operation = step.operation.as_deref().unwrap_or_default();
                self.call(step.system.as_ref(), operation, input, correlation)
                    .await
                    .map(StepOutcome::output)
            }
            StepKind::Conditional => {
                let subject = if step.input.is_empty() {
                    context_view(context)
                } else {
                    input
                };
                let (result, reason) = evaluate_conditions(&step.conditions, &subject);
                Ok(StepOutcome {
                    output: json!({"result": result, "reason": reason}),
                    halt: !result && step.halt_on_false,
                })
            }
            StepKind::Parallel => self.run_parallel(step, context, correlation).await,
            StepKind::Custom => {
                let name = step.handler.as_deref().unwrap_or_default();
                let handler = self
                    .handlers
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| WorkflowError::step(format!("no handler registered for '{name}'")))?;
                handler.run(input, context).await.map(StepOutcome::output)
            }
        }
    }

    async fn run_parallel(
        &self,
        step: &Step,
        context: &ExecutionContext,
        correlation: &Correlation,
    ) -> Result<StepOutcome, WorkflowError> {
        let calls = step.tasks.iter().map(|task| async move {
            let input = Value::Object(template::resolve_map(&task.input, context));
            let result = self
                .call(task.system.as_ref(), &task.operation, input, correlation)
                .await;
            (task.id.clone(), result)
        });

        let mut results = Map::new();
        let mut errors = Map::new();
        for (task_id, result) in join_all(calls).await {
            match result {
                Ok(data) => {
                    results.insert(task_id, data);
                }
                Err(e) => {
                    errors.insert(task_id, Value::String(e.to_string()));
                }
            }
        }

        if results.is_empty() && !errors.is_empty() {
            return Err(WorkflowError::step(format!(
                "all {} parallel tasks failed: {}",
                errors.len(),
                Value::Object(errors)
            )));
        }
        Ok(StepOutcome::output(json!({
            "succeeded": results.len(),
            "failed": errors.len(),
            "results": results,
            "errors": errors,
        })))
    }

    /// Send one request through the gateway; an error response is a step
    /// error.
    async fn call(
        &self,
        system: Option<&SystemId>,
        operation: &str,
        input: Value,
        correlation: &Correlation,
    ) -> Result<Value, WorkflowError> {
        let payload = Payload::from_operation(operation, input)?;
        let mut request = Request::new(self.config.request_source.as_str(), operation, payload)
            .with_tag("workflow_id", correlation.workflow_id.as_str())
            .with_tag("execution_id", correlation.execution_id.as_str());
        if let Some(system) = system {
            request = request.with_target(system.clone());
        }
        if let Some(user) = &correlation.user_id {
            request = request.with_user(user.as_str());
        }
        if let Some(credential) = &correlation.credential {
            request = request.with_credential(credential.clone());
        }

        let response = self.gateway.process_request(&request).await;
        if response.is_success() {
            return Ok(response.data.unwrap_or(Value::Null));
        }
        Err(WorkflowError::step(response.error.map_or_else(
            || format!("{operation} returned {:?}", response.status),
            |e| format!("{}: {}", e.code, e.message),
        )))
    }

    fn update<R>(&self, id: &ExecutionId, f: impl FnOnce(&mut WorkflowExecution) -> R) -> Option<R> {
        let now = self.clock.utc();
        self.executions.get_mut(id).map(|mut execution| {
            let result = f(&mut execution);
            execution.updated_at = now;
            result
        })
    }

    fn is_running(&self, id: &ExecutionId) -> bool {
        self.executions
            .get(id)
            .is_some_and(|e| e.status == ExecutionStatus::Running)
    }

    /// Queue a finished execution for retention, evicting the oldest.
    fn finish(&self, id: &ExecutionId) {
        let mut finished = self.finished.lock();
        finished.push_back(id.clone());
        while finished.len() > self.config.max_retained_executions {
            if let Some(old) = finished.pop_front() {
                self.executions.remove(&old);
            }
        }
    }

    fn metadata(&self, correlation: &Correlation, step_id: Option<&str>) -> EventMetadata {
        let metadata =
            EventMetadata::for_execution(correlation.workflow_id.clone(), correlation.execution_id.clone());
        match step_id {
            Some(step) => metadata.with_step(step),
            None => metadata,
        }
    }

    fn publish(&self, event_type: &str, metadata: EventMetadata, mut payload: Value) {
        let Some(bus) = &self.bus else {
            return;
        };
        if let Value::Object(map) = &mut payload {
            if let Some(workflow_id) = &metadata.workflow_id {
                map.insert("workflow_id".into(), json!(workflow_id));
            }
            if let Some(execution_id) = &metadata.execution_id {
                map.insert("execution_id".into(), json!(execution_id));
            }
        }
        if let Err(e) = bus.publish(event_type, payload, WORKFLOW_SOURCE, Some(metadata)) {
            warn!(event_type, error = %e, "failed to publish workflow event");
        }
    }
}

/// Apply the step's output mapping with `previous` bound to the raw result.
fn map_output(step: &Step, context: &ExecutionContext, raw: Value) -> Value {
    if step.output.is_empty() {
        return raw;
    }
    let mut scoped = context.clone();
    scoped.previous = raw;
    Value::Object(template::resolve_map(&step.output, &scoped))
}

fn skip_remaining(execution: &mut WorkflowExecution, workflow: &Workflow, from: usize, now: DateTime<Utc>) {
    for step in workflow.steps.iter().skip(from) {
        execution.step_results.push(StepRecord {
            step_id: step.id.clone(),
            status: StepStatus::Skipped,
            attempts: 0,
            output: None,
            error: None,
            finished_at: now,
        });
    }
}

/// The whole context as one value, for conditionals without an input
/// mapping: `workflow.input.*`, `workflow.variables.*`, `steps.*`,
/// `previous.*`.
fn context_view(context: &ExecutionContext) -> Value {
    json!({
        "workflow": {"input": context.input, "variables": context.variables},
        "steps": context.steps,
        "previous": context.previous,
    })
}

/// Starts a workflow for every event matching one of its triggers.
struct TriggerHandler {
    engine: Weak<Inner>,
    workflow_id: WorkflowId,
}

#[async_trait]
impl EventHandler for TriggerHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        // Events of the workflow's own executions never re-trigger it.
        if event.metadata.workflow_id.as_ref() == Some(&self.workflow_id) {
            return Ok(());
        }
        let metadata = HashMap::from([
            ("trigger_event_id".to_owned(), event.id.to_string()),
            ("trigger_event_type".to_owned(), event.event_type.clone()),
        ]);
        let id = engine
            .start(&self.workflow_id, event.payload.clone(), metadata, None)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        debug!(workflow_id = %self.workflow_id, execution_id = %id, event_type = %event.event_type, "workflow triggered by event");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unnecessary_literal_bound)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use conduit_bus::BusConfig;
    use conduit_core::{Condition, ConditionOperator, ManualClock, ParallelTask};
    use conduit_executor::{ExecutorConfig, RetryStrategy};
    use conduit_provider::{DynProvider, ProviderError};

    use super::*;
    use crate::builder::{GatewayBuilder, SystemConfig};
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::load_balancer::Endpoint;

    // -- Mock providers -------------------------------------------------------

    /// Returns the request payload plus a fixed score.
    struct Echo(&'static str);

    #[async_trait]
    impl DynProvider for Echo {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, request: &Request, _endpoint: &str) -> Result<Value, ProviderError> {
            Ok(json!({"operation": request.operation, "input": request.payload.to_value(), "score": 0.9}))
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    /// Fails its first `failures` calls with a permanent error.
    struct Flaky {
        name: &'static str,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DynProvider for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _request: &Request, _endpoint: &str) -> Result<Value, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ProviderError::ExecutionFailed("rejected".into()));
            }
            Ok(json!({"call": call + 1}))
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Slow(&'static str);

    #[async_trait]
    impl DynProvider for Slow {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _request: &Request, _endpoint: &str) -> Result<Value, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({"slow": true}))
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Doubler;

    #[async_trait]
    impl CustomStep for Doubler {
        async fn run(&self, input: Value, _context: &ExecutionContext) -> Result<Value, WorkflowError> {
            let n = input["n"]
                .as_i64()
                .ok_or_else(|| WorkflowError::step("n must be an integer"))?;
            Ok(json!({"doubled": n * 2}))
        }
    }

    /// Cancels every execution of its workflow, then fails.
    struct CancelsThenFails {
        engine: Mutex<Option<WorkflowEngine>>,
    }

    #[async_trait]
    impl CustomStep for CancelsThenFails {
        async fn run(&self, _input: Value, _context: &ExecutionContext) -> Result<Value, WorkflowError> {
            let engine = self.engine.lock().clone();
            if let Some(engine) = engine {
                for execution in engine.list_executions(Some("self-cancel")) {
                    engine.cancel_execution(&execution.id)?;
                }
            }
            Err(WorkflowError::step("gave up"))
        }
    }

    // -- Helpers ----------------------------------------------------------------

    fn gateway_with(providers: Vec<Arc<dyn DynProvider>>, bus: Option<EventBus>) -> Arc<Gateway> {
        let mut builder = GatewayBuilder::new()
            .clock(Arc::new(ManualClock::new()))
            .executor_config(ExecutorConfig {
                max_retries: 0,
                retry_strategy: RetryStrategy::Constant {
                    delay: Duration::from_millis(1),
                },
                ..ExecutorConfig::default()
            });
        for provider in providers {
            let name = provider.name().to_owned();
            builder = builder
                .system(SystemConfig::new(name.as_str(), vec![Endpoint::new(format!("http://{name}"))]))
                .provider(provider);
        }
        if let Some(bus) = bus {
            builder = builder.event_bus(bus);
        }
        Arc::new(builder.build().unwrap())
    }

    fn engine(providers: Vec<Arc<dyn DynProvider>>) -> WorkflowEngine {
        WorkflowEngine::new(gateway_with(providers, None), WorkflowConfig::default())
    }

    async fn wait_done(engine: &WorkflowEngine, id: &ExecutionId) -> WorkflowExecution {
        for _ in 0..500 {
            if let Some(execution) = engine.get_execution(id)
                && execution.status.is_terminal()
            {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {id} did not finish");
    }

    fn statuses(execution: &WorkflowExecution) -> Vec<(&str, StepStatus)> {
        execution
            .step_results
            .iter()
            .map(|r| (r.step_id.as_str(), r.status))
            .collect()
    }

    // -- Execution ----------------------------------------------------------------

    #[tokio::test]
    async fn steps_thread_outputs_into_later_inputs() {
        let engine = engine(vec![Arc::new(Echo("cns")), Arc::new(Echo("ledger"))]);
        engine
            .register_workflow(
                Workflow::new("settle")
                    .with_step(Step::system_call("check", "cns.check").with_input("amount", "{{workflow.input.amount}}"))
                    .with_step(
                        Step::system_call("record", "ledger.record")
                            .with_input("amount", "{{steps.check.input.amount}}")
                            .with_input("note", "score {{previous.score}}"),
                    ),
            )
            .unwrap();

        let id = engine
            .execute_workflow("settle", json!({"amount": 250}), HashMap::new())
            .unwrap();
        let execution = wait_done(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            statuses(&execution),
            [("check", StepStatus::Completed), ("record", StepStatus::Completed)]
        );
        let record = &execution.context.steps["record"];
        assert_eq!(record["input"], json!({"amount": 250, "note": "score 0.9"}));
        assert!(execution.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_skips_remaining_steps() {
        let engine = engine(vec![
            Arc::new(Flaky {
                name: "cns",
                failures: u32::MAX,
                calls: AtomicU32::new(0),
            }),
            Arc::new(Echo("ledger")),
        ]);
        engine
            .register_workflow(
                Workflow::new("settle")
                    .with_step(Step::system_call("check", "cns.check"))
                    .with_step(Step::system_call("record", "ledger.record")),
            )
            .unwrap();

        let id = engine
            .execute_workflow("settle", json!({}), HashMap::new())
            .unwrap();
        let execution = wait_done(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            statuses(&execution),
            [("check", StepStatus::Failed), ("record", StepStatus::Skipped)]
        );
        assert!(execution.errors[0].contains("SYSTEM_EXECUTION_ERROR"));
    }

    #[tokio::test]
    async fn step_retries_use_the_same_step() {
        let flaky = Arc::new(Flaky {
            name: "cns",
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let engine = engine(vec![flaky.clone()]);
        engine
            .register_workflow(Workflow::new("retrying").with_step(Step::system_call("check", "cns.check").with_retry(3, 0)))
            .unwrap();

        let id = engine
            .execute_workflow("retrying", json!({}), HashMap::new())
            .unwrap();
        let execution = wait_done(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step("check").unwrap().attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn negative_conditional_continues_unless_halting() {
        let engine = engine(vec![Arc::new(Echo("cns"))]);
        let gate = || {
            Step::conditional(
                "gate",
                vec![Condition::new("workflow.input.amount", ConditionOperator::Gt, json!(100))],
            )
        };
        engine
            .register_workflow(
                Workflow::new("soft")
                    .with_step(gate())
                    .with_step(Step::system_call("check", "cns.check")),
            )
            .unwrap();
        engine
            .register_workflow(
                Workflow::new("hard")
                    .with_step(gate().halting_on_false())
                    .with_step(Step::system_call("check", "cns.check")),
            )
            .unwrap();

        let soft = engine.execute_workflow("soft", json!({"amount": 5}), HashMap::new()).unwrap();
        let soft = wait_done(&engine, &soft).await;
        assert_eq!(soft.status, ExecutionStatus::Completed);
        assert_eq!(soft.context.steps["gate"]["result"], json!(false));
        assert_eq!(soft.step("check").unwrap().status, StepStatus::Completed);

        let hard = engine.execute_workflow("hard", json!({"amount": 5}), HashMap::new()).unwrap();
        let hard = wait_done(&engine, &hard).await;
        assert_eq!(hard.status, ExecutionStatus::Completed);
        assert_eq!(hard.step("check").unwrap().status, StepStatus::Skipped);

        let passing = engine.execute_workflow("hard", json!({"amount": 500}), HashMap::new()).unwrap();
        let passing = wait_done(&engine, &passing).await;
        assert_eq!(passing.step("check").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_step_is_best_effort() {
        let engine = engine(vec![
            Arc::new(Echo("cns")),
            Arc::new(Flaky {
                name: "ledger",
                failures: u32::MAX,
                calls: AtomicU32::new(0),
            }),
        ]);
        let task = |id: &str, op: &str| ParallelTask {
            id: id.into(),
            system: None,
            operation: op.into(),
            input: Map::new(),
        };
        engine
            .register_workflow(
                Workflow::new("fanout").with_step(Step::parallel(
                    "both",
                    vec![task("a", "cns.check"), task("b", "ledger.record")],
                )),
            )
            .unwrap();
        engine
            .register_workflow(
                Workflow::new("doomed").with_step(Step::parallel("only", vec![task("b", "ledger.record")])),
            )
            .unwrap();

        let id = engine.execute_workflow("fanout", json!({}), HashMap::new()).unwrap();
        let execution = wait_done(&engine, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let output = &execution.context.steps["both"];
        assert_eq!(output["succeeded"], 1);
        assert_eq!(output["failed"], 1);
        assert!(output["results"]["a"].is_object());
        assert!(output["errors"]["b"].is_string());

        let id = engine.execute_workflow("doomed", json!({}), HashMap::new()).unwrap();
        assert_eq!(wait_done(&engine, &id).await.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn custom_steps_and_persisted_outputs() {
        let engine = engine(vec![Arc::new(Echo("cns"))]);
        engine.register_step_handler("double", Arc::new(Doubler));
        engine
            .register_workflow(
                Workflow::new("custom")
                    .with_step(
                        Step::custom("twice", "double")
                            .with_input("n", "{{workflow.input.n}}")
                            .with_output("total", "{{previous.doubled}}")
                            .persisted(),
                    )
                    .with_step(Step::system_call("check", "cns.check").with_input("total", "{{workflow.variables.total}}"))
                    .with_step(Step::custom("missing", "nope")),
            )
            .unwrap();

        let id = engine.execute_workflow("custom", json!({"n": 21}), HashMap::new()).unwrap();
        let execution = wait_done(&engine, &id).await;

        assert_eq!(execution.context.variables["total"], json!(42));
        assert_eq!(execution.context.steps["twice"], json!({"total": 42}));
        assert_eq!(execution.context.steps["check"]["input"]["total"], json!(42));
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.errors[0].contains("no handler registered for 'nope'"));
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_fails_the_step() {
        let engine = engine(vec![Arc::new(Slow("cns"))]);
        engine
            .register_workflow(Workflow::new("slow").with_step(Step::system_call("check", "cns.check").with_timeout_ms(100)))
            .unwrap();

        let id = engine.execute_workflow("slow", json!({}), HashMap::new()).unwrap();
        let execution = wait_done(&engine, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.errors[0].contains("timed out after 100ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_step_returns_its_probe_slot_and_connection() {
        let gateway = Arc::new(
            GatewayBuilder::new()
                .clock(Arc::new(ManualClock::new()))
                .system(
                    SystemConfig::new("cns", vec![Endpoint::new("http://cns")]).with_circuit_breaker(
                        CircuitBreakerConfig {
                            failure_threshold: 1,
                            volume_threshold: 1,
                            success_threshold: 2,
                            timeout: Duration::ZERO,
                            ..CircuitBreakerConfig::default()
                        },
                    ),
                )
                .provider(Arc::new(Slow("cns")))
                .build()
                .unwrap(),
        );
        let breaker = gateway.circuit_breakers().get("cns").unwrap();
        breaker.record_failure("SYSTEM_EXECUTION_ERROR", "down", Duration::ZERO);
        assert_eq!(breaker.state(), CircuitState::Open);

        let engine = WorkflowEngine::new(Arc::clone(&gateway), WorkflowConfig::default());
        engine
            .register_workflow(Workflow::new("slow").with_step(Step::system_call("check", "cns.check").with_timeout_ms(100)))
            .unwrap();
        for _ in 0..2 {
            let id = engine.execute_workflow("slow", json!({}), HashMap::new()).unwrap();
            let execution = wait_done(&engine, &id).await;
            assert!(execution.errors[0].contains("timed out after 100ms"));
        }

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert_eq!(snapshot.probes_in_flight, 0);
        assert_eq!(gateway.load_balancer().health("cns")[0].active_connections, 0);
        // A third caller is still admitted as a probe.
        assert!(breaker.check_availability().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_in_flight_result() {
        let engine = engine(vec![Arc::new(Slow("cns"))]);
        engine
            .register_workflow(
                Workflow::new("slow")
                    .with_step(Step::system_call("first", "cns.check"))
                    .with_step(Step::system_call("second", "cns.check")),
            )
            .unwrap();

        let id = engine.execute_workflow("slow", json!({}), HashMap::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.cancel_execution(&id).unwrap());
        assert!(!engine.cancel_execution(&id).unwrap());

        engine.shutdown().await;
        let execution = engine.get_execution(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(execution.step_results.is_empty());
        assert!(matches!(
            engine.cancel_execution("nope"),
            Err(WorkflowError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn step_failure_after_cancellation_keeps_cancelled_state() {
        let bus = EventBus::with_clock(BusConfig::default(), Arc::new(ManualClock::new()));
        let (_sub, mut rx) = bus
            .subscribe_channel("workflow.*", 32, SubscribeOptions::default())
            .unwrap();
        let engine = WorkflowEngine::new(
            gateway_with(vec![Arc::new(Echo("cns"))], Some(bus.clone())),
            WorkflowConfig::default(),
        );
        let step = Arc::new(CancelsThenFails {
            engine: Mutex::new(Some(engine.clone())),
        });
        engine.register_step_handler("cancel-then-fail", step.clone());
        engine
            .register_workflow(
                Workflow::new("self-cancel")
                    .with_step(Step::custom("quit", "cancel-then-fail"))
                    .with_step(Step::system_call("check", "cns.check")),
            )
            .unwrap();

        let id = engine.execute_workflow("self-cancel", json!({}), HashMap::new()).unwrap();
        engine.shutdown().await;
        step.engine.lock().take();

        let execution = engine.get_execution(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(execution.step_results.is_empty());
        assert!(execution.errors.is_empty());
        assert_eq!(engine.list_executions(Some("self-cancel")).len(), 1);

        bus.tick().await;
        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(types, ["workflow.started", "workflow.cancelled"]);
    }

    #[tokio::test]
    async fn unknown_and_inactive_workflows_are_rejected() {
        let engine = engine(vec![Arc::new(Echo("cns"))]);
        assert!(matches!(
            engine.execute_workflow("ghost", json!({}), HashMap::new()),
            Err(WorkflowError::NotFound(_))
        ));

        let mut workflow = Workflow::new("paused").with_step(Step::system_call("check", "cns.check"));
        workflow.status = WorkflowStatus::Inactive;
        engine.register_workflow(workflow).unwrap();
        assert!(matches!(
            engine.execute_workflow("paused", json!({}), HashMap::new()),
            Err(WorkflowError::Inactive(_))
        ));

        assert!(matches!(
            engine.register_workflow(Workflow::new("empty")),
            Err(WorkflowError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn finished_executions_are_bounded() {
        let engine = WorkflowEngine::new(
            gateway_with(vec![Arc::new(Echo("cns"))], None),
            WorkflowConfig {
                max_retained_executions: 2,
                ..WorkflowConfig::default()
            },
        );
        engine
            .register_workflow(Workflow::new("quick").with_step(Step::system_call("check", "cns.check")))
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = engine.execute_workflow("quick", json!({}), HashMap::new()).unwrap();
            wait_done(&engine, &id).await;
            ids.push(id);
        }

        assert!(engine.get_execution(&ids[0]).is_none());
        assert_eq!(engine.list_executions(Some("quick")).len(), 2);
        assert!(engine.list_executions(Some("other")).is_empty());
    }

    // -- Events -------------------------------------------------------------------

    #[tokio::test]
    async fn lifecycle_events_and_event_triggers() {
        let bus = EventBus::with_clock(BusConfig::default(), Arc::new(ManualClock::new()));
        let (_sub, mut rx) = bus
            .subscribe_channel("workflow.*", 32, SubscribeOptions::default())
            .unwrap();
        let engine = WorkflowEngine::new(
            gateway_with(vec![Arc::new(Echo("marketplace"))], Some(bus.clone())),
            WorkflowConfig::default(),
        );
        engine
            .register_workflow(
                Workflow::new("on-order")
                    .with_trigger(Trigger::Event {
                        pattern: "order.created".into(),
                    })
                    .with_step(
                        Step::system_call("buy", "marketplace.purchase").with_input("item_id", "{{workflow.input.sku}}"),
                    ),
            )
            .unwrap();

        bus.publish("order.created", json!({"sku": "gpu-1"}), "shop", None)
            .unwrap();
        bus.tick().await;

        let execution = loop {
            if let Some(execution) = engine.list_executions(Some("on-order")).pop() {
                break wait_done(&engine, &execution.id).await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.metadata["trigger_event_type"], "order.created");
        assert_eq!(
            execution.context.steps["buy"]["input"]["item_id"],
            json!("gpu-1")
        );

        bus.tick().await;
        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.metadata.execution_id.as_ref(), Some(&execution.id));
            types.push(event.event_type);
        }
        assert_eq!(
            types,
            ["workflow.started", "workflow.step.completed", "workflow.completed"]
        );
    }
}
