use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use conduit_bus::{EventBus, HealthStatus};
use conduit_core::{Clock, Request, Response, SystemId};
use conduit_executor::{DispatchExecutor, ExecutionError, error_code};
use conduit_provider::{ProviderError, ProviderRegistry, is_transient_message};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthenticationService;
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot, CircuitState, Transition};
use crate::error::GatewayError;
use crate::load_balancer::{EndpointHealth, LoadBalancer};
use crate::metrics::{MetricsCollector, MetricsSnapshot, Outcome};
use crate::rate_limiter::RateLimiter;
use crate::router::RequestRouter;
use crate::transformer::ResponseTransformer;

/// Source reported on responses rejected before a system was chosen.
pub const GATEWAY_SOURCE: &str = "gateway";

/// Health of one configured system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub system: String,
    pub circuit: CircuitState,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
}

/// Result of [`Gateway::health`].
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub systems: Vec<SystemHealth>,
}

/// Result of [`Gateway::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub metrics: MetricsSnapshot,
    pub circuits: Vec<CircuitSnapshot>,
    pub endpoints: BTreeMap<String, Vec<EndpointHealth>>,
    pub rate_limit_buckets: usize,
    pub in_flight: usize,
}

/// A request that made it through dispatch.
struct Dispatched {
    data: Value,
    endpoint: String,
    load: f64,
}

/// Single entry point for operation requests.
///
/// Construct with [`GatewayBuilder`](crate::GatewayBuilder). Every
/// component is built once and shared immutably; each handles its own
/// interior mutability.
pub struct Gateway {
    pub(crate) router: RequestRouter,
    pub(crate) auth: AuthenticationService,
    pub(crate) rate_limiter: Option<RateLimiter>,
    pub(crate) circuit_breakers: CircuitBreakerRegistry,
    pub(crate) load_balancer: LoadBalancer,
    pub(crate) providers: ProviderRegistry,
    pub(crate) executor: DispatchExecutor,
    pub(crate) transformer: ResponseTransformer,
    pub(crate) metrics: MetricsCollector,
    pub(crate) bus: Option<EventBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) started_at: Instant,
}

impl Gateway {
    /// Run `request` through the full pipeline.
    ///
    /// Never fails: every error becomes an error (or timeout) response
    /// carrying a stable code and a retry hint.
    #[instrument(
        name = "gateway.process_request",
        skip(self, request),
        fields(request_id = %request.id, operation = %request.operation, system)
    )]
    pub async fn process_request(&self, request: &Request) -> Response {
        let started = self.clock.now();
        let mut system: Option<SystemId> = None;

        let result = self.run_pipeline(request, &mut system).await;
        let elapsed = self.clock.now().saturating_duration_since(started);
        let processing_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(dispatched) => {
                let system = system.unwrap_or_else(|| SystemId::from(GATEWAY_SOURCE));
                let transformed = self
                    .transformer
                    .transform(&system, &request.operation, dispatched.data);
                self.metrics.record(Some(&system), Outcome::Success, elapsed);

                let mut response = Response::success(request.id.clone(), system, transformed.data);
                response.metadata.timestamp = self.clock.utc();
                response.metadata.processing_time_ms = processing_ms;
                response.metadata.system_load = dispatched.load;
                response.metadata.endpoint = Some(dispatched.endpoint);
                response.metadata.transformation_trace = transformed.trace;
                debug!(processing_ms, "request completed");
                response
            }
            Err(err) => {
                self.metrics.record(
                    system.as_deref(),
                    Outcome::from_error_code(err.code()),
                    elapsed,
                );
                let source = system.unwrap_or_else(|| SystemId::from(GATEWAY_SOURCE));
                let info = err.to_error_info();
                let mut response = if err.is_timeout() {
                    Response::timeout(request.id.clone(), source, info)
                } else {
                    Response::error(request.id.clone(), source, info)
                };
                response.metadata.timestamp = self.clock.utc();
                response.metadata.processing_time_ms = processing_ms;
                debug!(code = err.code(), error = %err, processing_ms, "request failed");
                response
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &Request,
        system: &mut Option<SystemId>,
    ) -> Result<Dispatched, GatewayError> {
        // 1. Validation.
        if request.operation.trim().is_empty() {
            return Err(GatewayError::Validation("operation must not be empty".into()));
        }
        request.payload.validate_for(&request.operation)?;

        // 2. Authentication and authorization.
        let context = self.auth.authenticate(request)?;
        self.auth.authorize(&context, &request.operation)?;

        // 3. Rate limits. Either every identifier is charged or none is.
        if let Some(limiter) = &self.rate_limiter {
            let identifiers = [
                format!("user:{}", context.user_id),
                format!("resource:{}", request.operation),
            ];
            limiter.consume_all(&identifiers)?;
        }

        // 4. Routing.
        let target = self.router.determine_target(request)?;
        tracing::Span::current().record("system", target.as_str());
        *system = Some(target.clone());

        // 5. Circuit breaker. The permit frees its probe slot if this
        // future is dropped before the outcome is reported.
        let permit = match self.circuit_breakers.get(&target) {
            Some(breaker) => {
                let permit = breaker.check_availability().inspect_err(|_| {
                    debug!(system = %target, "circuit open, rejecting request");
                })?;
                if let Some(t) = permit.transition() {
                    self.on_transition(&target, t);
                }
                Some(permit)
            }
            None => None,
        };

        // 6. Endpoint selection.
        let provider = self
            .providers
            .get(&target)
            .ok_or_else(|| GatewayError::UnknownSystem(target.to_string()))?;
        let selection = self.load_balancer.select_endpoint(&target)?;

        // 7. Dispatch. Likewise the guard closes the connection on drop.
        let connection = self.load_balancer.connect(&target, &selection.url);
        let result = self
            .executor
            .execute(provider.as_ref(), request, &selection.url)
            .await;
        let dispatch_elapsed = connection.finish();

        match result {
            Ok(outcome) => {
                if let Some(t) = permit.and_then(|p| p.succeed(outcome.elapsed)) {
                    self.on_transition(&target, t);
                }
                Ok(Dispatched {
                    data: outcome.data,
                    endpoint: selection.url,
                    load: selection.load_score,
                })
            }
            Err(err) => {
                let kind = match &err {
                    ExecutionError::Failed { error, .. } => error_code(error),
                    ExecutionError::TimedOut { .. } => "TIMEOUT",
                    ExecutionError::Closed => "CLOSED",
                };
                let message = err.to_string();
                warn!(system = %target, endpoint = %selection.url, error = %message, "dispatch failed");
                if let Some(t) = permit.and_then(|p| p.fail(kind, &message, dispatch_elapsed)) {
                    self.on_transition(&target, t);
                }
                Err(execution_error(&target, err))
            }
        }
    }

    fn on_transition(&self, system: &str, (from, to): Transition) {
        info!(system, from = %from, to = %to, "circuit state changed");
        self.metrics.record_circuit_transition();
    }

    /// Run the periodic breaker evaluation.
    pub fn evaluate_circuits(&self) -> Vec<(String, Transition)> {
        let transitions = self.circuit_breakers.evaluate_all();
        for (system, transition) in &transitions {
            self.on_transition(system, *transition);
        }
        transitions
    }

    pub fn health(&self) -> GatewayHealth {
        let systems: Vec<SystemHealth> = self
            .router
            .systems()
            .iter()
            .map(|system| SystemHealth {
                system: system.to_string(),
                circuit: self
                    .circuit_breakers
                    .get(system)
                    .map_or(CircuitState::Closed, |b| b.state()),
                healthy_endpoints: self.load_balancer.healthy_count(system),
                total_endpoints: self.load_balancer.endpoints(system).map_or(0, <[_]>::len),
            })
            .collect();

        let impaired = systems
            .iter()
            .filter(|s| s.circuit == CircuitState::Open || s.healthy_endpoints == 0)
            .count();
        let status = if systems.is_empty() || impaired == systems.len() {
            HealthStatus::Unhealthy
        } else if impaired > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        GatewayHealth {
            status,
            uptime_secs: self.clock.now().saturating_duration_since(self.started_at).as_secs(),
            systems,
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            metrics: self.metrics.snapshot(),
            circuits: self.circuit_breakers.snapshots(),
            endpoints: self.load_balancer.all_health(),
            rate_limit_buckets: self.rate_limiter.as_ref().map_or(0, RateLimiter::bucket_count),
            in_flight: self.executor.in_flight(),
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn auth(&self) -> &AuthenticationService {
        &self.auth
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.circuit_breakers
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn event_bus(&self) -> Option<&EventBus> {
        self.bus.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

fn execution_error(system: &str, err: ExecutionError) -> GatewayError {
    match err {
        ExecutionError::TimedOut { after, .. }
        | ExecutionError::Failed {
            error: ProviderError::Timeout(after),
            ..
        } => GatewayError::Timeout {
            system: system.to_owned(),
            after,
        },
        ExecutionError::Failed { error, .. } => {
            let message = error.to_string();
            GatewayError::SystemExecution {
                system: system.to_owned(),
                retryable: error.is_retryable() || is_transient_message(&message),
                message,
            }
        }
        ExecutionError::Closed => GatewayError::SystemExecution {
            system: system.to_owned(),
            message: "executor is closed".into(),
            retryable: false,
        },
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("systems", self.router.systems())
            .field("providers", &self.providers)
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}
