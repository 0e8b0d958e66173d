use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use conduit_core::{Clock, Event, EventId, EventMetadata, HandlerId, SystemClock, SystemId};
use conduit_executor::DeadLetterQueue;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::breaker::HandlerBreaker;
use crate::config::BusConfig;
use crate::error::{BusError, HandlerError};
use crate::handler::{ChannelHandler, EventHandler, SubscribeOptions};
use crate::pattern::EventPattern;
use crate::scheduler::RetryScheduler;
use crate::schema::{CompiledSchema, EventSchema};
use crate::stats::{BusHealth, BusStats, BusStatsSnapshot, HealthStatus};

/// A delivery that exhausted its retries.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEvent {
    pub id: String,
    pub original_event: Event,
    pub error: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub handler_id: HandlerId,
}

/// Public view of one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub pattern: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub last_executed: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub failure_count: u64,
    pub breaker_open: bool,
}

/// What one [`EventBus::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub events: usize,
    pub retries: usize,
}

struct Registration {
    id: HandlerId,
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
    breaker: HandlerBreaker,
    order: u64,
    created_at: DateTime<Utc>,
    last_executed: Mutex<Option<DateTime<Utc>>>,
    executions: AtomicU64,
    failures: AtomicU64,
}

struct PendingRetry {
    event: Event,
    handler_id: HandlerId,
    attempt: u32,
}

struct Inner {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    queue: Mutex<VecDeque<Event>>,
    handlers: RwLock<HashMap<HandlerId, Arc<Registration>>>,
    schemas: RwLock<HashMap<String, CompiledSchema>>,
    retries: Mutex<RetryScheduler<PendingRetry>>,
    dead_letters: DeadLetterQueue<DeadLetterEvent>,
    stats: BusStats,
    next_order: AtomicU64,
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`cancel`](Self::cancel) to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: HandlerId,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> &HandlerId {
        &self.id
    }

    /// Remove the subscription. Returns `false` if it was already gone.
    pub fn cancel(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|inner| inner.handlers.write().remove(&self.id).is_some())
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queue", &self.queue.lock().len())
            .field("handlers", &self.handlers.read().len())
            .finish_non_exhaustive()
    }
}

/// Queued publish/subscribe bus.
///
/// Cloning is cheap and every clone shares the same queue and subscriptions.
/// Nothing is delivered until [`tick`](Self::tick) runs, either from
/// [`run`](Self::run) or directly in tests.
#[derive(Clone, Debug)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        let dead_letters = DeadLetterQueue::new(config.dead_letter_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                queue: Mutex::new(VecDeque::new()),
                handlers: RwLock::new(HashMap::new()),
                schemas: RwLock::new(HashMap::new()),
                retries: Mutex::new(RetryScheduler::new()),
                dead_letters,
                stats: BusStats::default(),
                next_order: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    // -- Publishing -----------------------------------------------------------

    /// Build an event and enqueue it.
    pub fn publish(
        &self,
        event_type: impl Into<String>,
        payload: Value,
        source: impl Into<SystemId>,
        metadata: Option<EventMetadata>,
    ) -> Result<EventId, BusError> {
        let mut event = Event::new(event_type, source, payload);
        event.timestamp = self.inner.clock.utc();
        if let Some(metadata) = metadata {
            event.metadata = metadata;
        }
        self.publish_event(event)
    }

    /// Validate a prepared event against its schema and enqueue it.
    pub fn publish_event(&self, event: Event) -> Result<EventId, BusError> {
        if event.event_type.is_empty() {
            return Err(BusError::EmptyEventType);
        }
        if let Some(schema) = self.inner.schemas.read().get(&event.event_type) {
            schema.check(&event)?;
        }
        self.enqueue(event)
    }

    fn enqueue(&self, event: Event) -> Result<EventId, BusError> {
        let mut queue = self.inner.queue.lock();
        self.push_locked(&mut queue, event)
    }

    fn push_locked(&self, queue: &mut VecDeque<Event>, event: Event) -> Result<EventId, BusError> {
        let capacity = self.inner.config.max_queue_size;
        if queue.len() >= capacity {
            warn!(event_type = %event.event_type, capacity, "event queue full, rejecting publish");
            return Err(BusError::QueueFull { capacity });
        }
        let id = event.id.clone();
        debug!(event_id = %id, event_type = %event.event_type, "event queued");
        queue.push_back(event);
        BusStats::incr(&self.inner.stats.published);
        Ok(id)
    }

    /// Declare the shape of `event_type`. Replaces any earlier schema.
    pub fn register_schema(
        &self,
        event_type: impl Into<String>,
        schema: &EventSchema,
    ) -> Result<(), BusError> {
        let event_type = event_type.into();
        let compiled = CompiledSchema::compile(&event_type, schema)?;
        self.inner.schemas.write().insert(event_type, compiled);
        Ok(())
    }

    // -- Subscriptions --------------------------------------------------------

    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription, BusError> {
        let pattern = EventPattern::parse(pattern)?;
        let id = HandlerId::generate();
        let registration = Registration {
            id: id.clone(),
            breaker: HandlerBreaker::new(options.breaker),
            pattern,
            handler,
            options,
            order: self.inner.next_order.fetch_add(1, Ordering::Relaxed),
            created_at: self.inner.clock.utc(),
            last_executed: Mutex::new(None),
            executions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        };
        info!(
            handler_id = %id,
            pattern = %registration.pattern.as_str(),
            priority = registration.options.priority,
            "subscription added"
        );
        self.inner
            .handlers
            .write()
            .insert(id.clone(), Arc::new(registration));
        Ok(Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Subscribe with a channel instead of a handler object.
    ///
    /// A full channel applies backpressure to the tick; a dropped receiver
    /// turns every delivery into a handler failure.
    pub fn subscribe_channel(
        &self,
        pattern: &str,
        buffer: usize,
        options: SubscribeOptions,
    ) -> Result<(Subscription, mpsc::Receiver<Event>), BusError> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let subscription = self.subscribe(pattern, Arc::new(ChannelHandler { tx }), options)?;
        Ok((subscription, rx))
    }

    pub fn unsubscribe(&self, id: &HandlerId) -> bool {
        let removed = self.inner.handlers.write().remove(id).is_some();
        if removed {
            info!(handler_id = %id, "subscription removed");
        }
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn list_handlers(&self) -> Vec<HandlerInfo> {
        let now = self.inner.clock.now();
        let mut list: Vec<(u64, HandlerInfo)> = self
            .inner
            .handlers
            .read()
            .values()
            .map(|r| {
                (
                    r.order,
                    HandlerInfo {
                        id: r.id.clone(),
                        pattern: r.pattern.as_str().to_owned(),
                        priority: r.options.priority,
                        created_at: r.created_at,
                        last_executed: *r.last_executed.lock(),
                        execution_count: r.executions.load(Ordering::Relaxed),
                        failure_count: r.failures.load(Ordering::Relaxed),
                        breaker_open: r.breaker.is_open(now),
                    },
                )
            })
            .collect();
        list.sort_by_key(|(order, _)| *order);
        list.into_iter().map(|(_, info)| info).collect()
    }

    // -- Processing -----------------------------------------------------------

    /// Drain the queue and run every retry that has come due.
    ///
    /// Events are processed in publish order. Each event's matching handlers
    /// are started in priority order and awaited together.
    #[instrument(name = "bus.tick", skip(self), fields(events, retries))]
    pub async fn tick(&self) -> TickReport {
        let events: Vec<Event> = self.inner.queue.lock().drain(..).collect();
        let report_events = events.len();
        for event in events {
            self.dispatch(event).await;
        }

        let due = self.inner.retries.lock().pop_due(self.inner.clock.now());
        let report_retries = due.len();
        join_all(due.into_iter().map(|pending| self.run_retry(pending))).await;

        let span = tracing::Span::current();
        span.record("events", report_events);
        span.record("retries", report_retries);
        TickReport {
            events: report_events,
            retries: report_retries,
        }
    }

    /// Tick on the configured interval until `shutdown_rx` fires, then
    /// flush whatever is still queued.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.inner.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            tick_ms = %self.inner.config.tick_interval.as_millis(),
            "event bus started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        self.tick().await;
        info!("event bus stopped");
    }

    async fn dispatch(&self, event: Event) {
        let mut matching: Vec<Arc<Registration>> = self
            .inner
            .handlers
            .read()
            .values()
            .filter(|r| r.pattern.matches(&event.event_type))
            .cloned()
            .collect();

        if matching.is_empty() {
            debug!(event_id = %event.id, event_type = %event.event_type, "no subscribers");
            BusStats::incr(&self.inner.stats.unrouted);
            return;
        }

        matching.sort_by(|a, b| {
            b.options
                .priority
                .cmp(&a.options.priority)
                .then(a.order.cmp(&b.order))
        });

        join_all(
            matching
                .into_iter()
                .map(|registration| self.invoke(registration, event.clone(), 1)),
        )
        .await;
        BusStats::incr(&self.inner.stats.processed);
    }

    async fn run_retry(&self, pending: PendingRetry) {
        let registration = self.inner.handlers.read().get(&pending.handler_id).cloned();
        match registration {
            Some(registration) => {
                BusStats::incr(&self.inner.stats.retried);
                self.invoke(registration, pending.event, pending.attempt)
                    .await;
            }
            None => {
                debug!(handler_id = %pending.handler_id, "retry dropped, handler unsubscribed");
            }
        }
    }

    async fn invoke(&self, registration: Arc<Registration>, event: Event, attempt: u32) {
        let clock = &self.inner.clock;

        if !registration.breaker.allow(clock.now()) {
            BusStats::incr(&self.inner.stats.skipped);
            debug!(handler_id = %registration.id, event_id = %event.id, "handler circuit open, skipping");
            if registration.options.dead_letter {
                self.dead_letter(&registration, event, "handler circuit open".into(), attempt - 1);
            }
            return;
        }

        BusStats::incr(&self.inner.stats.invocations);
        registration.executions.fetch_add(1, Ordering::Relaxed);
        *registration.last_executed.lock() = Some(clock.utc());

        let timeout = registration
            .options
            .timeout
            .unwrap_or(self.inner.config.default_handler_timeout);
        let result = match tokio::time::timeout(timeout, registration.handler.handle(&event)).await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::new(format!(
                "handler timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        let error = match result {
            Ok(()) => {
                registration.breaker.record_success();
                return;
            }
            Err(error) => error,
        };

        registration.failures.fetch_add(1, Ordering::Relaxed);
        if registration.breaker.record_failure(clock.now()) {
            warn!(handler_id = %registration.id, "handler circuit opened");
        }

        if let Some(retry) = registration.options.retry
            && attempt <= retry.max_retries
        {
            let delay = retry.strategy().delay_for(attempt - 1);
            warn!(
                handler_id = %registration.id,
                event_id = %event.id,
                attempt,
                delay_ms = %delay.as_millis(),
                error = %error,
                "handler failed, retry scheduled"
            );
            self.inner.retries.lock().schedule(
                clock.now() + delay,
                PendingRetry {
                    event,
                    handler_id: registration.id.clone(),
                    attempt: attempt + 1,
                },
            );
            return;
        }

        BusStats::incr(&self.inner.stats.failed);
        warn!(
            handler_id = %registration.id,
            event_id = %event.id,
            attempts = attempt,
            error = %error,
            "handler failed permanently"
        );
        if registration.options.dead_letter {
            self.dead_letter(&registration, event, error.to_string(), attempt - 1);
        }
    }

    fn dead_letter(&self, registration: &Registration, event: Event, error: String, retries: u32) {
        let entry = DeadLetterEvent {
            id: uuid::Uuid::now_v7().to_string(),
            original_event: event,
            error,
            retry_count: retries,
            timestamp: self.inner.clock.utc(),
            handler_id: registration.id.clone(),
        };
        debug!(dead_letter_id = %entry.id, handler_id = %registration.id, "event dead-lettered");
        self.inner.dead_letters.push(entry);
        BusStats::incr(&self.inner.stats.dead_lettered);
    }

    // -- Dead letters -----------------------------------------------------------

    pub fn dead_letters(&self) -> Vec<DeadLetterEvent> {
        self.inner.dead_letters.snapshot()
    }

    /// Put a dead-lettered event back on the live queue.
    ///
    /// The entry stays in the dead-letter queue when the live queue is full.
    pub fn reprocess_dead_letter(&self, id: &str) -> Result<EventId, BusError> {
        let capacity = self.inner.config.max_queue_size;
        let mut queue = self.inner.queue.lock();
        if queue.len() >= capacity && self.inner.dead_letters.contains_where(|e| e.id == id) {
            warn!(dead_letter_id = %id, capacity, "event queue full, dead letter left in place");
            return Err(BusError::QueueFull { capacity });
        }
        let entry = self
            .inner
            .dead_letters
            .take_where(|e| e.id == id)
            .ok_or_else(|| BusError::DeadLetterNotFound(id.to_owned()))?;
        info!(dead_letter_id = %id, event_id = %entry.original_event.id, "reprocessing dead letter");
        self.push_locked(&mut queue, entry.original_event)
    }

    // -- Introspection ----------------------------------------------------------

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.retries.lock().len()
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        let s = &self.inner.stats;
        BusStatsSnapshot {
            published: BusStats::load(&s.published),
            processed: BusStats::load(&s.processed),
            unrouted: BusStats::load(&s.unrouted),
            invocations: BusStats::load(&s.invocations),
            failed: BusStats::load(&s.failed),
            retried: BusStats::load(&s.retried),
            dead_lettered: BusStats::load(&s.dead_lettered),
            skipped: BusStats::load(&s.skipped),
            queue_size: self.queue_len(),
            pending_retries: self.pending_retries(),
            handler_count: self.handler_count(),
            dead_letter_size: self.inner.dead_letters.len(),
        }
    }

    /// Unhealthy when the queue is near capacity; degraded on backlog, an
    /// open handler breaker or a handler failing more often than the
    /// configured ratio.
    pub fn health_check(&self) -> BusHealth {
        let config = &self.inner.config;
        let now = self.inner.clock.now();
        let queue_size = self.queue_len();
        let mut issues = Vec::new();
        let mut open_breakers = Vec::new();
        let mut failing_handlers = Vec::new();

        for registration in self.inner.handlers.read().values() {
            if registration.breaker.is_open(now) {
                open_breakers.push(registration.id.clone());
            }
            let executions = registration.executions.load(Ordering::Relaxed);
            let failures = registration.failures.load(Ordering::Relaxed);
            #[allow(clippy::cast_precision_loss)]
            let failure_rate = if executions == 0 {
                0.0
            } else {
                failures as f64 / executions as f64
            };
            if failure_rate > config.failure_rate_threshold {
                failing_handlers.push(registration.id.clone());
            }
        }
        open_breakers.sort();
        failing_handlers.sort();

        let near_capacity = queue_size.saturating_mul(10) >= config.max_queue_size.saturating_mul(9);
        if near_capacity {
            issues.push(format!("queue near capacity ({queue_size}/{})", config.max_queue_size));
        } else if queue_size > config.backlog_warning {
            issues.push(format!("queue backlog of {queue_size} events"));
        }
        if !open_breakers.is_empty() {
            issues.push(format!("{} handler circuit(s) open", open_breakers.len()));
        }
        if !failing_handlers.is_empty() {
            issues.push(format!("{} handler(s) failing", failing_handlers.len()));
        }

        let status = if near_capacity {
            HealthStatus::Unhealthy
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        BusHealth {
            status,
            queue_size,
            pending_retries: self.pending_retries(),
            open_breakers,
            failing_handlers,
            issues,
        }
    }
}
