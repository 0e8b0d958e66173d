//! Background processor for periodic gateway maintenance.
//!
//! The background processor handles:
//! - Re-evaluating circuit breakers (open circuits move to half-open once
//!   their timeout passes)
//! - Probing endpoint health
//! - Sweeping idle rate-limit buckets
//! - Evaluating metric alerts and publishing them as `metrics.alert` events

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::gateway::{GATEWAY_SOURCE, Gateway};
use crate::load_balancer::HealthChange;
use crate::metrics::Alert;

/// Event type published for every raised alert.
pub const ALERT_EVENT: &str = "metrics.alert";

/// Configuration for the background processor.
#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    /// How often circuit breakers are re-evaluated (default: 5 seconds).
    pub circuit_interval: Duration,
    /// How often endpoints are probed. `None` uses the load balancer's
    /// configured health check interval.
    pub probe_interval: Option<Duration>,
    /// How often idle rate-limit buckets are swept (default: 60 seconds).
    pub sweep_interval: Duration,
    /// Buckets untouched for this long are dropped (default: 5 minutes).
    pub bucket_idle: Duration,
    /// How often alert thresholds are checked (default: 30 seconds).
    pub alert_interval: Duration,
    pub enable_probes: bool,
    pub enable_alerts: bool,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            circuit_interval: Duration::from_secs(5),
            probe_interval: None,
            sweep_interval: Duration::from_secs(60),
            bucket_idle: Duration::from_secs(300),
            alert_interval: Duration::from_secs(30),
            enable_probes: true,
            enable_alerts: true,
        }
    }
}

/// Runs the periodic gateway tasks until shutdown is signaled.
pub struct BackgroundProcessor {
    config: BackgroundConfig,
    gateway: Arc<Gateway>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl BackgroundProcessor {
    /// Returns the processor and its shutdown sender.
    pub fn new(config: BackgroundConfig, gateway: Arc<Gateway>) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                config,
                gateway,
                shutdown_rx,
            },
            shutdown_tx,
        )
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    /// Run the background processor until shutdown is signaled.
    pub async fn run(&mut self) {
        info!("background processor starting");

        let probe_every = self
            .config
            .probe_interval
            .unwrap_or(self.gateway.load_balancer().config().health_check_interval);
        let mut circuit_interval = interval(self.config.circuit_interval);
        let mut probe_interval = interval(probe_every);
        let mut sweep_interval = interval(self.config.sweep_interval);
        let mut alert_interval = interval(self.config.alert_interval);
        for timer in [
            &mut circuit_interval,
            &mut probe_interval,
            &mut sweep_interval,
            &mut alert_interval,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("background processor received shutdown signal");
                    break;
                }
                _ = circuit_interval.tick() => {
                    self.evaluate_circuits();
                }
                _ = probe_interval.tick(), if self.config.enable_probes => {
                    self.probe_endpoints().await;
                }
                _ = sweep_interval.tick() => {
                    self.sweep_buckets();
                }
                _ = alert_interval.tick(), if self.config.enable_alerts => {
                    self.evaluate_alerts();
                }
            }
        }

        info!("background processor stopped");
    }

    /// Re-evaluate every circuit breaker; returns the number of transitions.
    pub fn evaluate_circuits(&self) -> usize {
        let transitions = self.gateway.evaluate_circuits();
        if !transitions.is_empty() {
            debug!(count = transitions.len(), "circuit breakers changed state");
        }
        transitions.len()
    }

    pub async fn probe_endpoints(&self) -> Vec<HealthChange> {
        let changes = self
            .gateway
            .load_balancer()
            .probe_all(self.gateway.providers())
            .await;
        for change in &changes {
            debug!(system = %change.system, endpoint = %change.url, healthy = change.healthy, "endpoint probe changed health");
        }
        changes
    }

    pub fn sweep_buckets(&self) -> usize {
        self.gateway
            .rate_limiter()
            .map_or(0, |limiter| limiter.sweep_idle(self.config.bucket_idle))
    }

    /// Check alert thresholds and publish each raised alert.
    pub fn evaluate_alerts(&self) -> Vec<Alert> {
        let open = self.gateway.circuit_breakers().open_circuits();
        let alerts = self.gateway.metrics().evaluate_alerts(&open);

        if let Some(bus) = self.gateway.event_bus() {
            for alert in &alerts {
                let payload = match serde_json::to_value(alert) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize alert");
                        continue;
                    }
                };
                if let Err(e) = bus.publish(ALERT_EVENT, payload, GATEWAY_SOURCE, None) {
                    warn!(error = %e, system = %alert.system, "failed to publish alert");
                }
            }
        }
        alerts
    }
}

#[cfg(test)]
#[allow(clippy::unnecessary_literal_bound)]
mod tests {
    use async_trait::async_trait;
    use conduit_bus::{BusConfig, EventBus, SubscribeOptions};
    use conduit_core::{Clock, ManualClock, Payload, Request};
    use conduit_executor::{ExecutorConfig, RetryStrategy};
    use conduit_provider::{DynProvider, ProviderError};
    use serde_json::Value;

    use super::*;
    use crate::builder::{GatewayBuilder, SystemConfig};
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::load_balancer::{Endpoint, LoadBalancerConfig};
    use crate::metrics::AlertThresholds;
    use crate::rate_limiter::RateLimitRule;

    // -- Mock providers -------------------------------------------------------

    /// Fails every call and every probe.
    struct Down;

    #[async_trait]
    impl DynProvider for Down {
        fn name(&self) -> &str {
            "cns"
        }

        async fn execute(&self, _request: &Request, _endpoint: &str) -> Result<Value, ProviderError> {
            Err(ProviderError::Connection("refused".into()))
        }

        async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
            Err(ProviderError::Connection("refused".into()))
        }
    }

    // -- Helpers ----------------------------------------------------------------

    fn gateway(clock: Arc<ManualClock>, bus: Option<EventBus>) -> Arc<Gateway> {
        let mut builder = GatewayBuilder::new()
            .clock(clock)
            .system(
                SystemConfig::new("cns", vec![Endpoint::new("http://cns-1")]).with_circuit_breaker(
                    CircuitBreakerConfig {
                        failure_threshold: 1,
                        volume_threshold: 1,
                        timeout: Duration::from_secs(30),
                        ..CircuitBreakerConfig::default()
                    },
                ),
            )
            .provider(Arc::new(Down))
            .executor_config(ExecutorConfig {
                max_retries: 0,
                retry_strategy: RetryStrategy::Constant {
                    delay: Duration::from_millis(1),
                },
                ..ExecutorConfig::default()
            })
            .load_balancer(LoadBalancerConfig {
                unhealthy_threshold: 1,
                ..LoadBalancerConfig::default()
            })
            .rate_limits(vec![RateLimitRule::new("*", 100, Duration::from_secs(1))])
            .alert_thresholds(AlertThresholds {
                min_samples: 1,
                ..AlertThresholds::default()
            });
        if let Some(bus) = bus {
            builder = builder.event_bus(bus);
        }
        Arc::new(builder.build().unwrap())
    }

    async fn fail_once(gateway: &Gateway) {
        let response = gateway
            .process_request(&Request::new("web", "cns.ping", Payload::default()))
            .await;
        assert!(!response.is_success());
    }

    // -- Tasks ------------------------------------------------------------------

    #[tokio::test]
    async fn circuit_tick_moves_open_circuits_to_half_open() {
        let clock = Arc::new(ManualClock::new());
        let gateway = gateway(Arc::clone(&clock), None);
        let (processor, _shutdown) = BackgroundProcessor::new(BackgroundConfig::default(), Arc::clone(&gateway));

        fail_once(&gateway).await;
        let breaker = gateway.circuit_breakers().get("cns").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);

        assert_eq!(processor.evaluate_circuits(), 0);
        clock.advance(Duration::from_secs(31));
        assert_eq!(processor.evaluate_circuits(), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn probes_mark_failing_endpoints_unhealthy() {
        let gateway = gateway(Arc::new(ManualClock::new()), None);
        let (processor, _shutdown) = BackgroundProcessor::new(BackgroundConfig::default(), Arc::clone(&gateway));

        let changes = processor.probe_endpoints().await;
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].healthy);
        assert_eq!(gateway.load_balancer().healthy_count("cns"), 0);

        // Already unhealthy; no further change.
        assert!(processor.probe_endpoints().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_drops_idle_buckets() {
        let clock = Arc::new(ManualClock::new());
        let gateway = gateway(Arc::clone(&clock), None);
        let (processor, _shutdown) = BackgroundProcessor::new(
            BackgroundConfig {
                bucket_idle: Duration::from_secs(10),
                ..BackgroundConfig::default()
            },
            Arc::clone(&gateway),
        );

        fail_once(&gateway).await;
        assert_eq!(gateway.rate_limiter().unwrap().bucket_count(), 2);
        assert_eq!(processor.sweep_buckets(), 0);

        clock.advance(Duration::from_secs(11));
        assert_eq!(processor.sweep_buckets(), 2);
    }

    #[tokio::test]
    async fn alerts_are_published_on_the_bus() {
        let clock = Arc::new(ManualClock::new());
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let bus = EventBus::with_clock(BusConfig::default(), clock_dyn);
        let (_sub, mut rx) = bus
            .subscribe_channel(ALERT_EVENT, 8, SubscribeOptions::default())
            .unwrap();
        let gateway = gateway(clock, Some(bus.clone()));
        let (processor, _shutdown) = BackgroundProcessor::new(BackgroundConfig::default(), Arc::clone(&gateway));

        fail_once(&gateway).await;
        let alerts = processor.evaluate_alerts();
        // Error rate of 100% plus the open circuit.
        assert_eq!(alerts.len(), 2);

        bus.tick().await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, ALERT_EVENT);
        assert_eq!(first.payload["system"], "cns");
        assert_eq!(gateway.metrics().recent_alerts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn processor_starts_and_stops() {
        let gateway = gateway(Arc::new(ManualClock::new()), None);
        let (mut processor, shutdown_tx) = BackgroundProcessor::new(
            BackgroundConfig {
                circuit_interval: Duration::from_millis(100),
                probe_interval: Some(Duration::from_millis(100)),
                ..BackgroundConfig::default()
            },
            Arc::clone(&gateway),
        );

        let handle = tokio::spawn(async move {
            processor.run().await;
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();

        // The first probe tick fires immediately.
        assert_eq!(gateway.load_balancer().healthy_count("cns"), 0);
    }
}
