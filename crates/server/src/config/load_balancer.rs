use std::time::Duration;

use conduit_gateway::{LoadBalancerConfig, LoadBalancingStrategy};
use serde::Deserialize;

/// Endpoint selection and health probing.
///
/// `preferred_zone` installs a locality-preferring selector and only takes
/// effect with `strategy = "custom"`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerSection {
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    #[serde(default = "default_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub health_check_timeout_seconds: u64,
    /// Consecutive failed probes before an endpoint is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub preferred_zone: Option<String>,
}

impl Default for LoadBalancerSection {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::default(),
            health_check_interval_seconds: default_interval(),
            health_check_timeout_seconds: default_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            preferred_zone: None,
        }
    }
}

impl LoadBalancerSection {
    pub fn to_config(&self) -> LoadBalancerConfig {
        LoadBalancerConfig {
            strategy: self.strategy,
            health_check_interval: Duration::from_secs(self.health_check_interval_seconds),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_seconds),
            unhealthy_threshold: self.unhealthy_threshold,
        }
    }
}

fn default_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    3
}
