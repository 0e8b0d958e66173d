use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::Request;
use conduit_provider::{DynProvider, ProviderError};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub data: Value,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Sends requests to providers with bounded concurrency, per-attempt
/// deadlines and retry of transient failures.
///
/// The number of retries for a request is the smaller of
/// [`ExecutorConfig::max_retries`] and the request's own retry budget.
pub struct DispatchExecutor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
}

impl DispatchExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { config, semaphore }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Dispatches currently holding a concurrency permit.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent.max(1) - self.semaphore.available_permits()
    }

    /// Execute `request` against `endpoint` through `provider`.
    #[instrument(
        name = "executor.execute",
        skip_all,
        fields(request_id = %request.id, system = %provider.name(), endpoint = %endpoint, attempt)
    )]
    pub async fn execute(
        &self,
        provider: &dyn DynProvider,
        request: &Request,
        endpoint: &str,
    ) -> Result<DispatchOutcome, ExecutionError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExecutionError::Closed)?;

        let started = Instant::now();
        let max_retries = self.config.max_retries.min(request.metadata.retry_budget);
        let deadline = request.timeout().unwrap_or(self.config.execution_timeout);

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::Span::current().record("attempt", attempt);
            debug!(attempt, max_retries, "dispatching request");

            let failure = match tokio::time::timeout(deadline, provider.execute(request, endpoint))
                .await
            {
                Ok(Ok(data)) => {
                    return Ok(DispatchOutcome {
                        data,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(Err(error)) => ExecutionError::Failed {
                    error,
                    attempts: attempt,
                },
                Err(_elapsed) => ExecutionError::TimedOut {
                    after: deadline,
                    attempts: attempt,
                },
            };

            if !failure.is_retryable() || attempt > max_retries {
                warn!(
                    attempt,
                    error = %failure,
                    retryable = failure.is_retryable(),
                    "dispatch failed"
                );
                return Err(failure);
            }

            let delay = self.config.retry_strategy.delay_for(attempt - 1);
            warn!(
                attempt,
                error = %failure,
                delay_ms = %delay.as_millis(),
                "transient dispatch failure, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Short code for a provider error.
pub fn error_code(err: &ProviderError) -> &'static str {
    match err {
        ProviderError::NotFound(_) => "NOT_FOUND",
        ProviderError::ExecutionFailed(_) => "EXECUTION_FAILED",
        ProviderError::Timeout(_) => "TIMEOUT",
        ProviderError::Connection(_) => "CONNECTION",
        ProviderError::Unavailable(_) => "UNAVAILABLE",
        ProviderError::Configuration(_) => "CONFIGURATION",
        ProviderError::RateLimited => "RATE_LIMITED",
        ProviderError::Serialization(_) => "SERIALIZATION",
    }
}

#[cfg(test)]
#[allow(clippy::unnecessary_literal_bound)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use conduit_core::Payload;

    use super::*;
    use crate::retry::RetryStrategy;

    // -- Mock providers -------------------------------------------------------

    struct Succeeding;

    #[async_trait]
    impl DynProvider for Succeeding {
        fn name(&self) -> &str {
            "ok"
        }

        async fn execute(&self, _request: &Request, endpoint: &str) -> Result<Value, ProviderError> {
            Ok(serde_json::json!({"endpoint": endpoint}))
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    /// Fails with the given error until `failures` attempts have been made.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        transient: bool,
    }

    impl Flaky {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                transient,
            }
        }
    }

    #[async_trait]
    impl DynProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _request: &Request, _endpoint: &str) -> Result<Value, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                if self.transient {
                    return Err(ProviderError::Connection("reset by peer".into()));
                }
                return Err(ProviderError::ExecutionFailed("invalid document".into()));
            }
            Ok(serde_json::json!({"calls": n}))
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl DynProvider for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _request: &Request, _endpoint: &str) -> Result<Value, ProviderError> {
            tokio::time::sleep(self.0).await;
            Ok(Value::Null)
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    // -- Helpers ----------------------------------------------------------------

    fn request(retry_budget: u32) -> Request {
        Request::new("test", "cns.validate", Payload::default()).with_retry_budget(retry_budget)
    }

    fn executor(max_retries: u32) -> DispatchExecutor {
        DispatchExecutor::new(ExecutorConfig {
            max_retries,
            retry_strategy: RetryStrategy::Constant {
                delay: Duration::from_millis(10),
            },
            execution_timeout: Duration::from_millis(100),
            max_concurrent: 4,
        })
    }

    // -- Tests ------------------------------------------------------------------

    #[tokio::test]
    async fn success_on_first_attempt() {
        let outcome = executor(3)
            .execute(&Succeeding, &request(0), "http://a")
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.data["endpoint"], "http://a");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_use_the_retry_budget() {
        let provider = Flaky::new(2, true);
        let outcome = executor(5)
            .execute(&provider, &request(2), "http://a")
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_bounds_attempts() {
        let provider = Flaky::new(10, true);
        let err = executor(5)
            .execute(&provider, &request(1), "http://a")
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn config_caps_retry_budget() {
        let provider = Flaky::new(10, true);
        let err = executor(1)
            .execute(&provider, &request(9), "http://a")
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let provider = Flaky::new(10, false);
        let err = executor(5)
            .execute(&provider, &request(5), "http://a")
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let err = executor(0)
            .execute(&Slow(Duration::from_secs(5)), &request(0), "http://a")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_overrides_default() {
        let req = request(0).with_timeout(Duration::from_secs(10));
        let outcome = executor(0)
            .execute(&Slow(Duration::from_secs(5)), &req, "http://a")
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn error_codes() {
        assert_eq!(error_code(&ProviderError::RateLimited), "RATE_LIMITED");
        assert_eq!(error_code(&ProviderError::Unavailable("x".into())), "UNAVAILABLE");
    }
}
