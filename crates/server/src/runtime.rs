//! Assembles the gateway, event bus and workflow engine from configuration
//! and owns their background loops.

use std::sync::Arc;
use std::time::Duration;

use conduit_bus::EventBus;
use conduit_gateway::{
    BackgroundProcessor, Endpoint, Gateway, GatewayBuilder, LoadBalancingStrategy, LocalityPreference,
    RoutingRule, SystemConfig, WorkflowEngine,
};
use conduit_provider::{DynProvider, EchoProvider, HttpProvider};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BackgroundSection, ConduitConfig, ProviderKind, SystemEntry};
use crate::error::ServerError;

/// The running pieces shared by every API handler.
pub struct Runtime {
    gateway: Arc<Gateway>,
    bus: EventBus,
    engine: WorkflowEngine,
    background: BackgroundSection,
}

impl Runtime {
    /// Build every component and register the configured workflows.
    ///
    /// Nothing runs until [`Runtime::start`] is called.
    pub fn build(config: &ConduitConfig) -> Result<Self, ServerError> {
        let bus = EventBus::new(config.bus.to_config());

        let mut builder = GatewayBuilder::new()
            .event_bus(bus.clone())
            .executor_config(config.executor.to_config())
            .circuit_breaker_defaults(config.circuit_breaker.to_config())
            .load_balancer(config.load_balancer.to_config())
            .auth(config.auth.clone())
            .alert_thresholds(config.metrics.clone());

        for entry in &config.systems {
            let breaker = entry
                .circuit_breaker
                .as_ref()
                .map(|over| config.circuit_breaker.merged(over));
            let mut system = SystemConfig::new(entry.name.as_str(), endpoints_of(entry));
            if let Some(breaker) = breaker {
                system = system.with_circuit_breaker(breaker);
            }
            builder = builder.system(system).provider(provider_for(entry));
        }

        if let Some(zone) = &config.load_balancer.preferred_zone {
            if config.load_balancer.strategy != LoadBalancingStrategy::Custom {
                warn!(zone = %zone, "preferred_zone is ignored unless strategy = \"custom\"");
            }
            builder = builder.endpoint_selector(Arc::new(LocalityPreference::new(zone.clone())));
        }

        let rate_limits = config.rate_limit.to_rules();
        if !rate_limits.is_empty() {
            builder = builder.rate_limits(rate_limits);
        }

        for spec in &config.routing.rules {
            builder = builder.routing_rule(RoutingRule::from_spec(spec)?);
        }
        if !config.routing.keyword_routes.is_empty() {
            builder = builder.keyword_routes(config.routing.keyword_routes.clone());
        }
        if let Some(default) = &config.routing.default_system {
            builder = builder.default_system(default.as_str());
        }
        for rule in &config.transforms {
            builder = builder.transform(rule.clone());
        }

        let gateway = Arc::new(builder.build()?);
        let engine = WorkflowEngine::new(Arc::clone(&gateway), config.workflow_engine.to_config());
        for workflow in &config.workflows {
            engine.register_workflow(workflow.clone())?;
        }

        info!(
            systems = config.systems.len(),
            workflows = config.workflows.len(),
            "runtime assembled"
        );
        Ok(Self {
            gateway,
            bus,
            engine,
            background: config.background.clone(),
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Spawn the bus tick loop and the gateway's periodic tasks.
    pub fn start(&self) -> RunningTasks {
        let (bus_tx, bus_rx) = mpsc::channel(1);
        let bus = self.bus.clone();
        let bus_task = tokio::spawn(async move { bus.run(bus_rx).await });

        let (mut processor, background_tx) =
            BackgroundProcessor::new(self.background.to_config(), Arc::clone(&self.gateway));
        let background_task = tokio::spawn(async move { processor.run().await });

        RunningTasks {
            stops: vec![bus_tx, background_tx],
            tasks: vec![bus_task, background_task],
        }
    }

    /// Stop the loops and wait for in-flight workflow executions, giving up
    /// after `timeout`.
    pub async fn shutdown(&self, tasks: RunningTasks, timeout: Duration) {
        let drain = async {
            self.engine.shutdown().await;
            tasks.stop().await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "shutdown timed out, abandoning remaining work");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// Handles of the loops spawned by [`Runtime::start`].
pub struct RunningTasks {
    stops: Vec<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningTasks {
    async fn stop(self) {
        for stop in &self.stops {
            let _ = stop.send(()).await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

fn endpoints_of(entry: &SystemEntry) -> Vec<Endpoint> {
    entry
        .endpoints
        .iter()
        .map(|e| {
            let mut endpoint = Endpoint::new(e.url.as_str()).with_weight(e.weight);
            endpoint.max_connections = e.max_connections;
            match &e.zone {
                Some(zone) => endpoint.with_zone(zone.as_str()),
                None => endpoint,
            }
        })
        .collect()
}

fn provider_for(entry: &SystemEntry) -> Arc<dyn DynProvider> {
    match entry.provider {
        ProviderKind::Echo => Arc::new(EchoProvider::new(entry.name.as_str())),
        ProviderKind::Http => {
            Arc::new(HttpProvider::new(entry.name.as_str()).with_headers(entry.headers.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> ConduitConfig {
        ConduitConfig::from_toml(toml).unwrap()
    }

    const TWO_SYSTEMS: &str = r#"
        [[systems]]
        name = "marketplace"
        endpoints = [{ url = "http://mk-1", zone = "eu" }, { url = "http://mk-2" }]

        [[systems]]
        name = "cns"
        endpoints = [{ url = "http://cns-1" }]

        [systems.circuit_breaker]
        failure_threshold = 2
    "#;

    #[tokio::test]
    async fn builds_systems_with_breaker_overrides() {
        let runtime = Runtime::build(&config(TWO_SYSTEMS)).unwrap();
        let breakers = runtime.gateway().circuit_breakers();
        assert_eq!(breakers.get("cns").unwrap().config().failure_threshold, 2);
        assert_eq!(breakers.get("marketplace").unwrap().config().failure_threshold, 5);
        assert_eq!(runtime.gateway().load_balancer().endpoints("marketplace").unwrap().len(), 2);
        assert!(runtime.gateway().event_bus().is_some());
    }

    #[tokio::test]
    async fn empty_config_is_rejected() {
        let err = Runtime::build(&ConduitConfig::default()).unwrap_err();
        assert!(matches!(err, ServerError::Gateway(_)));
    }

    #[tokio::test]
    async fn invalid_workflow_fails_startup() {
        let toml = format!(
            "{TWO_SYSTEMS}\n[[workflows]]\nid = \"empty\"\nsteps = []\n"
        );
        let err = Runtime::build(&config(&toml)).unwrap_err();
        assert!(matches!(err, ServerError::Workflow(_)));
    }

    #[tokio::test]
    async fn routing_rule_targets_must_exist() {
        let toml = format!(
            "{TWO_SYSTEMS}\n[[routing.rules]]\npattern = \"x.*\"\ntarget = \"nowhere\"\n"
        );
        assert!(Runtime::build(&config(&toml)).is_err());
    }

    #[tokio::test]
    async fn start_and_shutdown_drain_the_bus() {
        let runtime = Runtime::build(&config(TWO_SYSTEMS)).unwrap();
        let tasks = runtime.start();
        runtime
            .bus()
            .publish("catalog.updated", serde_json::json!({}), "test", None)
            .unwrap();
        runtime.shutdown(tasks, Duration::from_secs(5)).await;
        assert_eq!(runtime.bus().queue_len(), 0);
    }
}
