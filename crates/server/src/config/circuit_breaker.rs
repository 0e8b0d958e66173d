use std::time::Duration;

use conduit_gateway::CircuitBreakerConfig;
use serde::Deserialize;

/// Default circuit breaker settings applied to every system.
///
/// # Example
///
/// ```toml
/// [circuit_breaker]
/// failure_threshold = 5
/// success_threshold = 2
/// timeout_seconds = 60
/// error_rate = 0.5
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerDefaults {
    /// Failures within the monitoring period that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful half-open probes needed to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting a probe.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_monitoring_seconds")]
    pub monitoring_period_seconds: u64,
    /// Minimum requests in the period before the error rate is considered.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u32,
    #[serde(default = "default_error_rate")]
    pub error_rate: Option<f64>,
}

impl Default for CircuitBreakerDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_timeout_seconds(),
            monitoring_period_seconds: default_monitoring_seconds(),
            volume_threshold: default_volume_threshold(),
            error_rate: default_error_rate(),
        }
    }
}

impl CircuitBreakerDefaults {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_seconds),
            monitoring_period: Duration::from_secs(self.monitoring_period_seconds),
            volume_threshold: self.volume_threshold,
            error_rate: self.error_rate,
        }
    }

    /// Layer a per-system override on top of these defaults.
    pub fn merged(&self, over: &CircuitBreakerOverride) -> CircuitBreakerConfig {
        let base = self.to_config();
        CircuitBreakerConfig {
            failure_threshold: over.failure_threshold.unwrap_or(base.failure_threshold),
            success_threshold: over.success_threshold.unwrap_or(base.success_threshold),
            timeout: over.timeout_seconds.map_or(base.timeout, Duration::from_secs),
            monitoring_period: over
                .monitoring_period_seconds
                .map_or(base.monitoring_period, Duration::from_secs),
            volume_threshold: over.volume_threshold.unwrap_or(base.volume_threshold),
            error_rate: over.error_rate.or(base.error_rate),
        }
    }
}

/// Per-system circuit breaker settings; unset fields inherit the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CircuitBreakerOverride {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub monitoring_period_seconds: Option<u64>,
    pub volume_threshold: Option<u32>,
    pub error_rate: Option<f64>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_monitoring_seconds() -> u64 {
    60
}

fn default_volume_threshold() -> u32 {
    10
}

#[allow(clippy::unnecessary_wraps)]
fn default_error_rate() -> Option<f64> {
    Some(0.5)
}
