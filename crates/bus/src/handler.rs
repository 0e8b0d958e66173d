use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::Event;
use conduit_executor::RetryStrategy;
use tokio::sync::mpsc;

use crate::breaker::BreakerOptions;
use crate::error::HandlerError;

/// Receives events delivered by the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```
/// use conduit_bus::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|event| async move {
///     if event.payload.is_null() {
///         return Err(HandlerError::new("empty payload"));
///     }
///     Ok(())
/// });
/// # drop(handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Forwards events into a channel.
pub(crate) struct ChannelHandler {
    pub(crate) tx: mpsc::Sender<Event>,
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| HandlerError::new("subscriber channel closed"))
    }
}

/// Backoff applied to a failing subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryOptions {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn strategy(&self) -> RetryStrategy {
        RetryStrategy::exponential(self.initial_delay, self.multiplier, self.max_delay)
    }
}

/// Options of one subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Retry failed deliveries. `None` disables retries.
    pub retry: Option<RetryOptions>,
    /// Higher priorities are invoked first.
    pub priority: i32,
    /// Per-invocation deadline; the bus default applies when unset.
    pub timeout: Option<Duration>,
    /// Keep exhausted deliveries in the dead-letter queue.
    pub dead_letter: bool,
    pub breaker: BreakerOptions,
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerOptions) -> Self {
        self.breaker = breaker;
        self
    }
}
