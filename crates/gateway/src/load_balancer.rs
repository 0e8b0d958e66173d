//! Endpoint selection and health tracking.
//!
//! Every configured system owns a pool of endpoint URLs. Health comes from
//! two sources: background probes (which flip endpoints unhealthy after
//! `unhealthy_threshold` consecutive failures and back on the first success)
//! and the [`ConnectionGuard`] the gateway holds around each dispatch
//! (active connections, load score and the response-time EMA).
//!
//! Selection never fails closed: when no endpoint is healthy every endpoint
//! becomes a candidate.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conduit_bus::EventBus;
use conduit_core::Clock;
use conduit_provider::ProviderRegistry;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// Smoothing factor of the response-time moving average.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    HealthScore,
    /// Delegate to the configured [`EndpointSelector`].
    Custom,
}

/// One concrete address of a system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: default_weight(),
            zone: None,
            max_connections: default_max_connections(),
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }
}

/// Observed health of one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
    pub url: String,
    pub healthy: bool,
    /// Moving average in milliseconds; `None` until the first sample.
    pub response_time_ms: Option<f64>,
    pub consecutive_failures: u32,
    /// `active_connections / max_connections`, clamped to `[0, 1]`.
    pub load_score: f64,
    pub active_connections: u32,
    pub total_requests: u64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl EndpointHealth {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            healthy: true,
            response_time_ms: None,
            consecutive_failures: 0,
            load_score: 0.0,
            active_connections: 0,
            total_requests: 0,
            last_checked: None,
        }
    }

    fn health_score(&self) -> f64 {
        0.4 * self.response_time_ms.unwrap_or(0.0)
            + 0.3 * self.load_score * 100.0
            + 0.3 * f64::from(self.active_connections) * 10.0
    }

    fn observe(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.response_time_ms = Some(match self.response_time_ms {
            Some(ema) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * ema,
            None => sample,
        });
    }
}

/// A candidate offered to an [`EndpointSelector`].
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub endpoint: &'a Endpoint,
    pub health: &'a EndpointHealth,
}

/// Pluggable selection used by [`LoadBalancingStrategy::Custom`].
///
/// Returning `None` falls back to round-robin.
pub trait EndpointSelector: Send + Sync + fmt::Debug {
    fn select(&self, system: &str, candidates: &[Candidate<'_>]) -> Option<usize>;
}

/// Prefer endpoints in a given zone.
#[derive(Debug, Clone)]
pub struct LocalityPreference {
    zone: String,
}

impl LocalityPreference {
    pub fn new(zone: impl Into<String>) -> Self {
        Self { zone: zone.into() }
    }
}

impl EndpointSelector for LocalityPreference {
    fn select(&self, _system: &str, candidates: &[Candidate<'_>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.endpoint.zone.as_deref() == Some(self.zone.as_str()))
            .min_by_key(|(_, c)| c.health.active_connections)
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Consecutive failed probes that mark an endpoint unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

/// The endpoint picked for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub url: String,
    pub load_score: f64,
}

/// A health flip caused by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChange {
    pub system: String,
    pub url: String,
    pub healthy: bool,
}

struct Pool {
    endpoints: Vec<Endpoint>,
    health: RwLock<Vec<EndpointHealth>>,
    counter: AtomicU64,
    weighted_counter: AtomicU64,
}

pub struct LoadBalancer {
    config: LoadBalancerConfig,
    pools: HashMap<String, Pool>,
    selector: Option<Arc<dyn EndpointSelector>>,
    bus: Option<EventBus>,
    clock: Arc<dyn Clock>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            pools: HashMap::new(),
            selector: None,
            bus: None,
            clock,
        }
    }

    pub fn add_system(&mut self, system: impl Into<String>, endpoints: Vec<Endpoint>) {
        let health = endpoints.iter().map(|e| EndpointHealth::new(&e.url)).collect();
        self.pools.insert(
            system.into(),
            Pool {
                endpoints,
                health: RwLock::new(health),
                counter: AtomicU64::new(0),
                weighted_counter: AtomicU64::new(0),
            },
        );
    }

    pub fn set_selector(&mut self, selector: Arc<dyn EndpointSelector>) {
        self.selector = Some(selector);
    }

    /// Publish endpoint health flips on `bus`.
    pub fn set_event_bus(&mut self, bus: EventBus) {
        self.bus = Some(bus);
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn systems(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn endpoints(&self, system: &str) -> Option<&[Endpoint]> {
        self.pools.get(system).map(|p| p.endpoints.as_slice())
    }

    /// Pick an endpoint of `system` with the configured strategy.
    pub fn select_endpoint(&self, system: &str) -> Result<Selection, GatewayError> {
        let pool = self
            .pools
            .get(system)
            .ok_or_else(|| GatewayError::UnknownSystem(system.to_owned()))?;
        if pool.endpoints.is_empty() {
            return Err(GatewayError::NoEndpoints(system.to_owned()));
        }

        let health = pool.health.read();
        let mut candidates: Vec<usize> = (0..pool.endpoints.len())
            .filter(|&i| health[i].healthy)
            .collect();
        if candidates.is_empty() {
            warn!(system, "no healthy endpoints, selecting among all");
            candidates = (0..pool.endpoints.len()).collect();
        }

        let round_robin = |candidates: &[usize]| {
            let n = pool.counter.fetch_add(1, Ordering::Relaxed);
            candidates[usize::try_from(n % candidates.len() as u64).unwrap_or(0)]
        };

        let chosen = match self.config.strategy {
            LoadBalancingStrategy::RoundRobin => round_robin(&candidates),
            LoadBalancingStrategy::WeightedRoundRobin => {
                let total: u64 = candidates
                    .iter()
                    .map(|&i| u64::from(pool.endpoints[i].weight.max(1)))
                    .sum();
                let mut target = pool.weighted_counter.fetch_add(1, Ordering::Relaxed) % total;
                let mut chosen = candidates[0];
                for &i in &candidates {
                    let weight = u64::from(pool.endpoints[i].weight.max(1));
                    if target < weight {
                        chosen = i;
                        break;
                    }
                    target -= weight;
                }
                chosen
            }
            LoadBalancingStrategy::LeastConnections => candidates
                .iter()
                .copied()
                .min_by_key(|&i| health[i].active_connections)
                .unwrap_or(candidates[0]),
            LoadBalancingStrategy::LeastResponseTime => candidates
                .iter()
                .copied()
                .filter_map(|i| health[i].response_time_ms.map(|rt| (i, rt)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or_else(|| round_robin(&candidates), |(i, _)| i),
            LoadBalancingStrategy::HealthScore => candidates
                .iter()
                .copied()
                .min_by(|&a, &b| health[a].health_score().total_cmp(&health[b].health_score()))
                .unwrap_or(candidates[0]),
            LoadBalancingStrategy::Custom => {
                let views: Vec<Candidate<'_>> = candidates
                    .iter()
                    .map(|&i| Candidate {
                        endpoint: &pool.endpoints[i],
                        health: &health[i],
                    })
                    .collect();
                self.selector
                    .as_ref()
                    .and_then(|s| s.select(system, &views))
                    .and_then(|picked| candidates.get(picked).copied())
                    .unwrap_or_else(|| round_robin(&candidates))
            }
        };

        debug!(system, endpoint = %pool.endpoints[chosen].url, strategy = ?self.config.strategy, "endpoint selected");
        Ok(Selection {
            url: pool.endpoints[chosen].url.clone(),
            load_score: health[chosen].load_score,
        })
    }

    fn with_health<R>(&self, system: &str, url: &str, f: impl FnOnce(&mut EndpointHealth, &Endpoint) -> R) -> Option<R> {
        let pool = self.pools.get(system)?;
        let index = pool.endpoints.iter().position(|e| e.url == url)?;
        let mut health = pool.health.write();
        Some(f(&mut health[index], &pool.endpoints[index]))
    }

    pub fn record_connection_start(&self, system: &str, url: &str) {
        self.with_health(system, url, |health, endpoint| {
            health.active_connections += 1;
            health.total_requests += 1;
            health.load_score = load_score(health.active_connections, endpoint.max_connections);
        });
    }

    pub fn record_connection_end(&self, system: &str, url: &str, elapsed: Duration) {
        self.close_connection(system, url, Some(elapsed));
    }

    fn close_connection(&self, system: &str, url: &str, elapsed: Option<Duration>) {
        self.with_health(system, url, |health, endpoint| {
            health.active_connections = health.active_connections.saturating_sub(1);
            health.load_score = load_score(health.active_connections, endpoint.max_connections);
            if let Some(elapsed) = elapsed {
                health.observe(elapsed);
            }
        });
    }

    /// Count a connection to `url` until the guard is finished or dropped.
    pub fn connect<'a>(&'a self, system: &'a str, url: &'a str) -> ConnectionGuard<'a> {
        self.record_connection_start(system, url);
        ConnectionGuard {
            balancer: self,
            system,
            url,
            started: self.clock.now(),
            open: true,
        }
    }

    /// Apply one probe result. Returns the health flip it caused, if any,
    /// after publishing it on the event bus.
    pub fn record_probe(&self, system: &str, url: &str, ok: bool, elapsed: Duration) -> Option<HealthChange> {
        let threshold = self.config.unhealthy_threshold.max(1);
        let now = self.clock.utc();
        let flipped = self.with_health(system, url, |health, _| {
            health.last_checked = Some(now);
            if ok {
                health.observe(elapsed);
                health.consecutive_failures = 0;
                if !health.healthy {
                    health.healthy = true;
                    return Some((true, 0));
                }
            } else {
                health.consecutive_failures += 1;
                if health.healthy && health.consecutive_failures >= threshold {
                    health.healthy = false;
                    return Some((false, health.consecutive_failures));
                }
            }
            None
        })??;

        let (healthy, failures) = flipped;
        let event_type = if healthy {
            info!(system, endpoint = url, "endpoint recovered");
            "loadbalancer.endpoint.healthy"
        } else {
            warn!(system, endpoint = url, failures, "endpoint marked unhealthy");
            "loadbalancer.endpoint.unhealthy"
        };
        if let Some(bus) = &self.bus
            && let Err(e) = bus.publish(
                event_type,
                json!({ "system": system, "endpoint": url, "consecutive_failures": failures }),
                "loadbalancer",
                None,
            )
        {
            warn!(error = %e, "failed to publish endpoint health event");
        }

        Some(HealthChange {
            system: system.to_owned(),
            url: url.to_owned(),
            healthy,
        })
    }

    /// Probe every endpoint of every system through its provider.
    pub async fn probe_all(&self, providers: &ProviderRegistry) -> Vec<HealthChange> {
        let timeout = self.config.health_check_timeout;
        let clock = &self.clock;
        let mut probes = Vec::new();
        for (system, pool) in &self.pools {
            let Some(provider) = providers.get(system) else {
                continue;
            };
            for endpoint in &pool.endpoints {
                let provider = Arc::clone(&provider);
                let url = endpoint.url.clone();
                let system = system.clone();
                probes.push(async move {
                    let started = clock.now();
                    let ok = matches!(
                        tokio::time::timeout(timeout, provider.health_check(&url)).await,
                        Ok(Ok(()))
                    );
                    (system, url, ok, clock.now().saturating_duration_since(started))
                });
            }
        }

        join_all(probes)
            .await
            .into_iter()
            .filter_map(|(system, url, ok, elapsed)| self.record_probe(&system, &url, ok, elapsed))
            .collect()
    }

    pub fn health(&self, system: &str) -> Vec<EndpointHealth> {
        self.pools
            .get(system)
            .map(|p| p.health.read().clone())
            .unwrap_or_default()
    }

    pub fn all_health(&self) -> BTreeMap<String, Vec<EndpointHealth>> {
        self.pools
            .iter()
            .map(|(system, pool)| (system.clone(), pool.health.read().clone()))
            .collect()
    }

    /// Healthy endpoint count of `system`.
    pub fn healthy_count(&self, system: &str) -> usize {
        self.pools
            .get(system)
            .map_or(0, |p| p.health.read().iter().filter(|h| h.healthy).count())
    }
}

/// An open connection counted against an endpoint.
///
/// [`finish`](Self::finish) closes it and feeds its duration into the
/// response-time average. Dropping it unfinished only closes it.
#[must_use = "dropping the guard closes the connection immediately"]
pub struct ConnectionGuard<'a> {
    balancer: &'a LoadBalancer,
    system: &'a str,
    url: &'a str,
    started: Instant,
    open: bool,
}

impl ConnectionGuard<'_> {
    /// Close the connection, returning how long it was open.
    pub fn finish(mut self) -> Duration {
        let elapsed = self.balancer.clock.now().saturating_duration_since(self.started);
        self.open = false;
        self.balancer.close_connection(self.system, self.url, Some(elapsed));
        elapsed
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            debug!(system = self.system, endpoint = self.url, "connection abandoned before completion");
            self.balancer.close_connection(self.system, self.url, None);
        }
    }
}

fn load_score(active: u32, max: u32) -> f64 {
    (f64::from(active) / f64::from(max.max(1))).clamp(0.0, 1.0)
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.config.strategy)
            .field("systems", &self.systems())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use conduit_bus::{BusConfig, SubscribeOptions};
    use conduit_core::{ManualClock, Request};
    use conduit_provider::{DynProvider, ProviderError};
    use serde_json::Value;

    use super::*;

    // -- Helpers ----------------------------------------------------------------

    fn balancer(strategy: LoadBalancingStrategy, endpoints: Vec<Endpoint>) -> LoadBalancer {
        let mut lb = LoadBalancer::new(
            LoadBalancerConfig {
                strategy,
                ..LoadBalancerConfig::default()
            },
            Arc::new(ManualClock::new()),
        );
        lb.add_system("cns", endpoints);
        lb
    }

    fn urls(n: usize) -> Vec<Endpoint> {
        (0..n).map(|i| Endpoint::new(format!("http://cns-{i}"))).collect()
    }

    fn pick(lb: &LoadBalancer) -> String {
        lb.select_endpoint("cns").unwrap().url
    }

    /// Healthy only when the url contains "up".
    struct Prober;

    #[async_trait]
    impl DynProvider for Prober {
        fn name(&self) -> &str {
            "cns"
        }

        async fn execute(&self, _request: &Request, _endpoint: &str) -> Result<Value, ProviderError> {
            Ok(Value::Null)
        }

        async fn health_check(&self, endpoint: &str) -> Result<(), ProviderError> {
            if endpoint.contains("up") {
                Ok(())
            } else {
                Err(ProviderError::Connection("refused".into()))
            }
        }
    }

    // -- Strategies -------------------------------------------------------------

    #[test]
    fn round_robin_is_balanced() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, urls(3));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            *counts.entry(pick(&lb)).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 3 || c == 4));
    }

    #[test]
    fn weighted_round_robin_follows_weights() {
        let lb = balancer(
            LoadBalancingStrategy::WeightedRoundRobin,
            vec![Endpoint::new("http://a").with_weight(3), Endpoint::new("http://b")],
        );
        let picks: Vec<String> = (0..8).map(|_| pick(&lb)).collect();
        assert_eq!(picks.iter().filter(|u| *u == "http://a").count(), 6);
        assert_eq!(picks[..4], ["http://a", "http://a", "http://a", "http://b"]);
    }

    #[test]
    fn least_connections_prefers_idle_endpoint() {
        let lb = balancer(LoadBalancingStrategy::LeastConnections, urls(2));
        lb.record_connection_start("cns", "http://cns-0");
        assert_eq!(pick(&lb), "http://cns-1");
        lb.record_connection_start("cns", "http://cns-1");
        lb.record_connection_start("cns", "http://cns-1");
        assert_eq!(pick(&lb), "http://cns-0");
    }

    #[test]
    fn least_response_time_ignores_unsampled() {
        let lb = balancer(LoadBalancingStrategy::LeastResponseTime, urls(3));
        lb.record_connection_start("cns", "http://cns-1");
        lb.record_connection_end("cns", "http://cns-1", Duration::from_millis(80));
        lb.record_connection_start("cns", "http://cns-2");
        lb.record_connection_end("cns", "http://cns-2", Duration::from_millis(20));
        assert_eq!(pick(&lb), "http://cns-2");
    }

    #[test]
    fn health_score_weighs_load() {
        let lb = balancer(LoadBalancingStrategy::HealthScore, urls(2));
        lb.record_connection_start("cns", "http://cns-0");
        assert_eq!(pick(&lb), "http://cns-1");
    }

    #[test]
    fn custom_selector_prefers_locality() {
        let mut lb = balancer(
            LoadBalancingStrategy::Custom,
            vec![
                Endpoint::new("http://us").with_zone("us-east"),
                Endpoint::new("http://eu").with_zone("eu-west"),
            ],
        );
        lb.set_selector(Arc::new(LocalityPreference::new("eu-west")));
        for _ in 0..3 {
            assert_eq!(pick(&lb), "http://eu");
        }
    }

    #[test]
    fn custom_without_match_falls_back_to_round_robin() {
        let mut lb = balancer(LoadBalancingStrategy::Custom, urls(2));
        lb.set_selector(Arc::new(LocalityPreference::new("mars")));
        assert_ne!(pick(&lb), pick(&lb));
    }

    // -- Health -----------------------------------------------------------------

    #[test]
    fn ema_smooths_response_times() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, urls(1));
        lb.record_connection_start("cns", "http://cns-0");
        lb.record_connection_end("cns", "http://cns-0", Duration::from_millis(100));
        lb.record_connection_start("cns", "http://cns-0");
        lb.record_connection_end("cns", "http://cns-0", Duration::from_millis(200));

        let health = lb.health("cns");
        let ema = health[0].response_time_ms.unwrap();
        assert!((ema - 110.0).abs() < 1e-6);
        assert_eq!(health[0].active_connections, 0);
        assert_eq!(health[0].total_requests, 2);
    }

    #[test]
    fn connection_guard_closes_on_finish_or_drop() {
        let clock = Arc::new(ManualClock::new());
        let mut lb = LoadBalancer::new(LoadBalancerConfig::default(), clock.clone());
        lb.add_system("cns", urls(1));

        let finished = lb.connect("cns", "http://cns-0");
        let abandoned = lb.connect("cns", "http://cns-0");
        assert_eq!(lb.health("cns")[0].active_connections, 2);

        clock.advance(Duration::from_millis(40));
        assert_eq!(finished.finish(), Duration::from_millis(40));
        drop(abandoned);

        let health = &lb.health("cns")[0];
        assert_eq!(health.active_connections, 0);
        assert!(health.load_score.abs() < f64::EPSILON);
        assert!((health.response_time_ms.unwrap() - 40.0).abs() < 1e-9);
        assert_eq!(health.total_requests, 2);
    }

    #[test]
    fn unhealthy_after_threshold_and_back_on_first_success() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, urls(2));
        assert!(lb.record_probe("cns", "http://cns-0", false, Duration::ZERO).is_none());
        assert!(lb.record_probe("cns", "http://cns-0", false, Duration::ZERO).is_none());
        let change = lb.record_probe("cns", "http://cns-0", false, Duration::ZERO).unwrap();
        assert!(!change.healthy);

        for _ in 0..4 {
            assert_eq!(pick(&lb), "http://cns-1");
        }

        let change = lb.record_probe("cns", "http://cns-0", true, Duration::from_millis(5)).unwrap();
        assert!(change.healthy);
        assert_eq!(lb.healthy_count("cns"), 2);
    }

    #[test]
    fn all_unhealthy_still_selects() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, urls(2));
        for url in ["http://cns-0", "http://cns-1"] {
            for _ in 0..3 {
                lb.record_probe("cns", url, false, Duration::ZERO);
            }
        }
        assert_eq!(lb.healthy_count("cns"), 0);
        assert!(lb.select_endpoint("cns").is_ok());
    }

    #[test]
    fn unknown_or_empty_systems_fail() {
        let mut lb = balancer(LoadBalancingStrategy::RoundRobin, urls(1));
        lb.add_system("empty", Vec::new());
        assert_eq!(lb.select_endpoint("nope").unwrap_err().code(), "UNKNOWN_SYSTEM");
        assert_eq!(lb.select_endpoint("empty").unwrap_err().code(), "NO_ENDPOINTS");
    }

    #[tokio::test]
    async fn probes_publish_health_events() {
        let bus = EventBus::with_clock(BusConfig::default(), Arc::new(ManualClock::new()));
        let (_sub, mut rx) = bus
            .subscribe_channel("loadbalancer.endpoint.*", 8, SubscribeOptions::default())
            .unwrap();

        let mut lb = LoadBalancer::new(
            LoadBalancerConfig {
                unhealthy_threshold: 1,
                ..LoadBalancerConfig::default()
            },
            Arc::new(ManualClock::new()),
        );
        lb.add_system("cns", vec![Endpoint::new("http://up"), Endpoint::new("http://down")]);
        lb.set_event_bus(bus.clone());

        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(Prober));

        let changes = lb.probe_all(&providers).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].url, "http://down");

        bus.tick().await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "loadbalancer.endpoint.unhealthy");
        assert_eq!(event.payload["endpoint"], "http://down");
    }
}
