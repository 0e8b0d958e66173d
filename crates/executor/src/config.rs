use std::time::Duration;

use crate::retry::RetryStrategy;

/// Settings of the [`DispatchExecutor`](crate::DispatchExecutor).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on retries; a request's own retry budget can only lower it.
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
    /// Per-attempt deadline when the request does not carry its own.
    pub execution_timeout: Duration,
    /// Dispatches allowed in flight at once.
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_strategy: RetryStrategy::default(),
            execution_timeout: Duration::from_secs(30),
            max_concurrent: 64,
        }
    }
}
