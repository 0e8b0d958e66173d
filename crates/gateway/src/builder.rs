use std::sync::Arc;

use conduit_bus::EventBus;
use conduit_core::{Clock, SystemClock, SystemId};
use conduit_executor::{DispatchExecutor, ExecutorConfig};
use conduit_provider::{DynProvider, ProviderRegistry};

use crate::auth::{AuthConfig, AuthenticationService};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::load_balancer::{Endpoint, EndpointSelector, LoadBalancer, LoadBalancerConfig};
use crate::metrics::{AlertThresholds, MetricsCollector};
use crate::rate_limiter::{RateLimitRule, RateLimiter};
use crate::router::{KeywordRoute, RequestRouter, RoutingRule};
use crate::transformer::{ResponseTransformer, TransformRule};

/// One backend system: its endpoints and an optional breaker override.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub name: SystemId,
    pub endpoints: Vec<Endpoint>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl SystemConfig {
    pub fn new(name: impl Into<SystemId>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            name: name.into(),
            endpoints,
            circuit_breaker: None,
        }
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }
}

/// Fluent builder for a [`Gateway`].
///
/// Every system needs a registered provider under the same name and at
/// least one endpoint. Everything else has a default: auth disabled, no rate
/// limits, no routing rules beyond the built-in keyword routes.
pub struct GatewayBuilder {
    systems: Vec<SystemConfig>,
    providers: ProviderRegistry,
    executor_config: ExecutorConfig,
    breaker_defaults: CircuitBreakerConfig,
    load_balancer_config: LoadBalancerConfig,
    selector: Option<Arc<dyn EndpointSelector>>,
    auth: AuthConfig,
    rate_limits: Option<Vec<RateLimitRule>>,
    rules: Vec<RoutingRule>,
    keyword_routes: Option<Vec<KeywordRoute>>,
    default_system: Option<SystemId>,
    transforms: Vec<TransformRule>,
    alert_thresholds: AlertThresholds,
    bus: Option<EventBus>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
            providers: ProviderRegistry::new(),
            executor_config: ExecutorConfig::default(),
            breaker_defaults: CircuitBreakerConfig::default(),
            load_balancer_config: LoadBalancerConfig::default(),
            selector: None,
            auth: AuthConfig::default(),
            rate_limits: None,
            rules: Vec::new(),
            keyword_routes: None,
            default_system: None,
            transforms: Vec::new(),
            alert_thresholds: AlertThresholds::default(),
            bus: None,
            clock: None,
        }
    }

    /// Add a backend system.
    #[must_use]
    pub fn system(mut self, system: SystemConfig) -> Self {
        self.systems.push(system);
        self
    }

    /// Register the provider serving the system of the same name.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn DynProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    #[must_use]
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Breaker settings for systems without their own override.
    #[must_use]
    pub fn circuit_breaker_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_defaults = config;
        self
    }

    #[must_use]
    pub fn load_balancer(mut self, config: LoadBalancerConfig) -> Self {
        self.load_balancer_config = config;
        self
    }

    /// Selector used by the `custom` strategy.
    #[must_use]
    pub fn endpoint_selector(mut self, selector: Arc<dyn EndpointSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    #[must_use]
    pub fn auth(mut self, config: AuthConfig) -> Self {
        self.auth = config;
        self
    }

    /// Enable rate limiting with `rules`.
    #[must_use]
    pub fn rate_limits(mut self, rules: Vec<RateLimitRule>) -> Self {
        self.rate_limits = Some(rules);
        self
    }

    #[must_use]
    pub fn routing_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Replace the built-in keyword routes.
    #[must_use]
    pub fn keyword_routes(mut self, routes: Vec<KeywordRoute>) -> Self {
        self.keyword_routes = Some(routes);
        self
    }

    #[must_use]
    pub fn default_system(mut self, system: impl Into<SystemId>) -> Self {
        self.default_system = Some(system.into());
        self
    }

    #[must_use]
    pub fn transform(mut self, rule: TransformRule) -> Self {
        self.transforms.push(rule);
        self
    }

    #[must_use]
    pub fn alert_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.alert_thresholds = thresholds;
        self
    }

    /// Bus used for endpoint health events.
    #[must_use]
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Consume the builder and produce a configured [`Gateway`].
    ///
    /// Fails with [`GatewayError::Configuration`] on any inconsistency.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        if self.systems.is_empty() {
            return Err(GatewayError::Configuration("at least one system is required".into()));
        }

        let mut router = RequestRouter::new(self.systems.iter().map(|s| s.name.clone()));
        if router.systems().len() != self.systems.len() {
            return Err(GatewayError::Configuration("system names must be unique".into()));
        }

        let mut circuit_breakers = CircuitBreakerRegistry::new(Arc::clone(&clock));
        let mut load_balancer = LoadBalancer::new(self.load_balancer_config, Arc::clone(&clock));
        for system in self.systems {
            if !self.providers.contains(&system.name) {
                return Err(GatewayError::Configuration(format!(
                    "system {} has no provider",
                    system.name
                )));
            }
            if system.endpoints.is_empty() {
                return Err(GatewayError::Configuration(format!(
                    "system {} has no endpoints",
                    system.name
                )));
            }
            let breaker = system
                .circuit_breaker
                .unwrap_or_else(|| self.breaker_defaults.clone());
            breaker.validate().map_err(|e| {
                GatewayError::Configuration(format!("circuit breaker for {}: {e}", system.name))
            })?;
            circuit_breakers.register(system.name.to_string(), breaker);
            load_balancer.add_system(system.name.to_string(), system.endpoints);
        }
        if let Some(selector) = self.selector {
            load_balancer.set_selector(selector);
        }
        if let Some(bus) = &self.bus {
            load_balancer.set_event_bus(bus.clone());
        }

        for rule in self.rules {
            router.add_rule(rule);
        }
        if let Some(routes) = self.keyword_routes {
            router.set_keyword_routes(routes);
        }
        router.set_default_system(self.default_system);
        router.validate()?;

        let rate_limiter = match self.rate_limits {
            Some(rules) => {
                for rule in &rules {
                    rule.validate().map_err(GatewayError::Configuration)?;
                }
                Some(RateLimiter::new(rules, Arc::clone(&clock)))
            }
            None => None,
        };

        let auth = AuthenticationService::new(self.auth, Arc::clone(&clock))?;
        let transformer = ResponseTransformer::new(self.transforms)?;

        Ok(Gateway {
            router,
            auth,
            rate_limiter,
            circuit_breakers,
            load_balancer,
            providers: self.providers,
            executor: DispatchExecutor::new(self.executor_config),
            transformer,
            metrics: MetricsCollector::new(self.alert_thresholds, Arc::clone(&clock)),
            bus: self.bus,
            started_at: clock.now(),
            clock,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_provider::EchoProvider;

    use super::*;

    fn cns() -> SystemConfig {
        SystemConfig::new("cns", vec![Endpoint::new("http://cns-1")])
    }

    fn echo(name: &str) -> Arc<dyn DynProvider> {
        Arc::new(EchoProvider::new(name))
    }

    fn config_error(builder: GatewayBuilder) -> String {
        match builder.build() {
            Err(GatewayError::Configuration(message)) => message,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn build_requires_a_system() {
        assert!(config_error(GatewayBuilder::new()).contains("at least one system"));
    }

    #[test]
    fn build_requires_a_provider_per_system() {
        let message = config_error(GatewayBuilder::new().system(cns()));
        assert!(message.contains("cns has no provider"));
    }

    #[test]
    fn build_requires_endpoints() {
        let message = config_error(
            GatewayBuilder::new()
                .system(SystemConfig::new("cns", Vec::new()))
                .provider(echo("cns")),
        );
        assert!(message.contains("no endpoints"));
    }

    #[test]
    fn build_rejects_duplicate_systems() {
        let message = config_error(
            GatewayBuilder::new()
                .system(cns())
                .system(cns())
                .provider(echo("cns")),
        );
        assert!(message.contains("unique"));
    }

    #[test]
    fn build_rejects_rules_for_unknown_systems() {
        let message = config_error(
            GatewayBuilder::new()
                .system(cns())
                .provider(echo("cns"))
                .routing_rule(RoutingRule::new("ledger.*", "ledger", 10).unwrap()),
        );
        assert!(message.contains("unknown system ledger"));
    }

    #[test]
    fn build_rejects_invalid_limits_and_breakers() {
        let zero_window = GatewayBuilder::new()
            .system(cns())
            .provider(echo("cns"))
            .rate_limits(vec![RateLimitRule::new("*", 10, Duration::ZERO)]);
        assert!(zero_window.build().is_err());

        let bad_breaker = GatewayBuilder::new()
            .system(cns().with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 0,
                ..CircuitBreakerConfig::default()
            }))
            .provider(echo("cns"));
        assert!(config_error(bad_breaker).contains("circuit breaker for cns"));
    }

    #[test]
    fn build_with_minimal_config_succeeds() {
        let gateway = GatewayBuilder::new()
            .system(cns())
            .provider(echo("cns"))
            .default_system("cns")
            .build()
            .unwrap();
        assert!(gateway.rate_limiter().is_none());
        assert_eq!(gateway.circuit_breakers().len(), 1);
        assert!(!gateway.auth().is_enabled());
    }
}
