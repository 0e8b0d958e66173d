use std::time::Duration;

use conduit_bus::BusConfig;
use conduit_executor::{ExecutorConfig, RetryStrategy};
use conduit_gateway::{BackgroundConfig, WorkflowConfig};
use serde::Deserialize;

/// Event bus tuning.
///
/// ```toml
/// [bus]
/// tick_interval_ms = 100
/// max_queue_size = 10000
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_queue")]
    pub max_queue_size: usize,
    #[serde(default = "default_dead_letters")]
    pub dead_letter_capacity: usize,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_seconds: u64,
    /// Queue depth above which the bus reports itself degraded.
    #[serde(default = "default_backlog_warning")]
    pub backlog_warning: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_ms(),
            max_queue_size: default_max_queue(),
            dead_letter_capacity: default_dead_letters(),
            handler_timeout_seconds: default_handler_timeout(),
            backlog_warning: default_backlog_warning(),
        }
    }
}

impl BusSection {
    pub fn to_config(&self) -> BusConfig {
        BusConfig {
            backlog_warning: self.backlog_warning,
            ..BusConfig::default()
        }
        .with_tick_interval(Duration::from_millis(self.tick_interval_ms))
        .with_max_queue_size(self.max_queue_size)
        .with_dead_letter_capacity(self.dead_letter_capacity)
        .with_default_handler_timeout(Duration::from_secs(self.handler_timeout_seconds))
    }
}

/// Dispatch retries, deadlines and concurrency.
///
/// ```toml
/// [executor]
/// max_retries = 3
/// retry_base_ms = 100
/// execution_timeout_seconds = 30
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            execution_timeout_seconds: default_execution_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl ExecutorSection {
    pub fn to_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_retries: self.max_retries,
            retry_strategy: RetryStrategy::Exponential {
                base: Duration::from_millis(self.retry_base_ms),
                max: Duration::from_millis(self.retry_max_ms),
                multiplier: 2.0,
                jitter: true,
            },
            execution_timeout: Duration::from_secs(self.execution_timeout_seconds),
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Intervals of the periodic gateway tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundSection {
    #[serde(default = "default_circuit_interval")]
    pub circuit_interval_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Rate-limit buckets idle this long are dropped.
    #[serde(default = "default_bucket_idle")]
    pub bucket_idle_seconds: u64,
    #[serde(default = "default_alert_interval")]
    pub alert_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub enable_probes: bool,
    #[serde(default = "default_true")]
    pub enable_alerts: bool,
}

impl Default for BackgroundSection {
    fn default() -> Self {
        Self {
            circuit_interval_seconds: default_circuit_interval(),
            sweep_interval_seconds: default_sweep_interval(),
            bucket_idle_seconds: default_bucket_idle(),
            alert_interval_seconds: default_alert_interval(),
            enable_probes: true,
            enable_alerts: true,
        }
    }
}

impl BackgroundSection {
    pub fn to_config(&self) -> BackgroundConfig {
        BackgroundConfig {
            circuit_interval: Duration::from_secs(self.circuit_interval_seconds),
            probe_interval: None,
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
            bucket_idle: Duration::from_secs(self.bucket_idle_seconds),
            alert_interval: Duration::from_secs(self.alert_interval_seconds),
            enable_probes: self.enable_probes,
            enable_alerts: self.enable_alerts,
        }
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_retained")]
    pub max_retained_executions: usize,
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_seconds: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_retained_executions: default_retained(),
            default_step_timeout_seconds: default_step_timeout(),
        }
    }
}

impl WorkflowSection {
    pub fn to_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            max_retained_executions: self.max_retained_executions,
            default_step_timeout: Duration::from_secs(self.default_step_timeout_seconds),
            ..WorkflowConfig::default()
        }
    }
}

fn default_tick_ms() -> u64 {
    100
}

fn default_max_queue() -> usize {
    10_000
}

fn default_dead_letters() -> usize {
    1_000
}

fn default_handler_timeout() -> u64 {
    30
}

fn default_backlog_warning() -> usize {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_execution_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    64
}

fn default_circuit_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_bucket_idle() -> u64 {
    300
}

fn default_alert_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_retained() -> usize {
    1_000
}

fn default_step_timeout() -> u64 {
    60
}
