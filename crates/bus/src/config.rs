use std::time::Duration;

/// Settings of an [`EventBus`](crate::EventBus).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How often the drain loop runs.
    pub tick_interval: Duration,
    /// Events allowed to wait in the queue before `publish` is refused.
    pub max_queue_size: usize,
    /// Capacity of the dead-letter buffer.
    pub dead_letter_capacity: usize,
    /// Handler deadline when a subscription does not set its own.
    pub default_handler_timeout: Duration,
    /// Queue length above which health degrades.
    pub backlog_warning: usize,
    /// Failure ratio above which a handler counts as failing.
    pub failure_rate_threshold: f64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            max_queue_size: 10_000,
            dead_letter_capacity: 1_000,
            default_handler_timeout: Duration::from_secs(30),
            backlog_warning: 1_000,
            failure_rate_threshold: 0.5,
        }
    }
}

impl BusConfig {
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    #[must_use]
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_default_handler_timeout(mut self, timeout: Duration) -> Self {
        self.default_handler_timeout = timeout;
        self
    }
}
