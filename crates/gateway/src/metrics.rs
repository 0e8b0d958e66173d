use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_core::Clock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Latency samples kept per system.
pub const LATENCY_WINDOW: usize = 1000;

/// Alerts kept in the recent-alerts list.
pub const RECENT_ALERTS: usize = 100;

/// How a processed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
    Timeout,
    RateLimited,
    CircuitRejected,
    AuthFailure,
    ValidationFailure,
}

impl Outcome {
    /// Classify an error response by its code.
    pub fn from_error_code(code: &str) -> Self {
        match code {
            "TIMEOUT" => Self::Timeout,
            "RATE_LIMIT_EXCEEDED" => Self::RateLimited,
            "CIRCUIT_OPEN" => Self::CircuitRejected,
            "AUTHENTICATION_ERROR" => Self::AuthFailure,
            "VALIDATION_ERROR" => Self::ValidationFailure,
            _ => Self::Failed,
        }
    }

    fn is_error(self) -> bool {
        self != Self::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Per-system error rate (0..=1) above which an alert is raised.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// Per-system p95 latency above which an alert is raised.
    #[serde(default = "default_p95_latency_ms")]
    pub p95_latency_ms: u64,
    /// Alert on any open circuit.
    #[serde(default = "default_true")]
    pub open_circuits: bool,
    /// Samples a system needs before rate and latency alerts apply.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_error_rate() -> f64 {
    0.1
}

fn default_p95_latency_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_min_samples() -> usize {
    20
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate(),
            p95_latency_ms: default_p95_latency_ms(),
            open_circuits: true,
            min_samples: default_min_samples(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    Latency,
    CircuitOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub system: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

/// Latency statistics of one system over its sample window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Default)]
struct SystemWindow {
    samples: VecDeque<(u64, bool)>,
}

impl SystemWindow {
    fn push(&mut self, latency_ms: u64, error: bool) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((latency_ms, error));
    }

    #[allow(clippy::cast_precision_loss)]
    fn stats(&self) -> LatencyStats {
        let count = self.samples.len();
        if count == 0 {
            return LatencyStats::default();
        }
        let mut sorted: Vec<u64> = self.samples.iter().map(|(ms, _)| *ms).collect();
        sorted.sort_unstable();
        let errors = self.samples.iter().filter(|(_, e)| *e).count();
        LatencyStats {
            count,
            errors,
            error_rate: errors as f64 / count as f64,
            avg_ms: sorted.iter().sum::<u64>() as f64 / count as f64,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            p50_ms: percentile(&sorted, 50),
            p95_ms: percentile(&sorted, 95),
            p99_ms: percentile(&sorted, 99),
        }
    }
}

/// Nearest-rank percentile of sorted, non-empty samples.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

/// Rolling request metrics and alerting.
///
/// Counters use relaxed atomics; per-system windows sit behind one mutex.
#[derive(Debug)]
pub struct MetricsCollector {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
    auth_failures: AtomicU64,
    validation_failures: AtomicU64,
    circuit_transitions: AtomicU64,
    systems: Mutex<HashMap<String, SystemWindow>>,
    alerts: Mutex<VecDeque<Alert>>,
    thresholds: AlertThresholds,
    clock: Arc<dyn Clock>,
}

impl MetricsCollector {
    pub fn new(thresholds: AlertThresholds, clock: Arc<dyn Clock>) -> Self {
        Self {
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            circuit_rejected: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            circuit_transitions: AtomicU64::new(0),
            systems: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            thresholds,
            clock,
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Record one processed request. Only requests that reached a system
    /// contribute latency samples.
    pub fn record(&self, system: Option<&str>, outcome: Outcome, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success => &self.succeeded,
            Outcome::Failed => &self.failed,
            Outcome::Timeout => &self.timeouts,
            Outcome::RateLimited => &self.rate_limited,
            Outcome::CircuitRejected => &self.circuit_rejected,
            Outcome::AuthFailure => &self.auth_failures,
            Outcome::ValidationFailure => &self.validation_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(system) = system
            && matches!(outcome, Outcome::Success | Outcome::Failed | Outcome::Timeout)
        {
            let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            self.systems
                .lock()
                .entry(system.to_owned())
                .or_default()
                .push(ms, outcome.is_error());
        }
    }

    pub fn record_circuit_transition(&self) {
        self.circuit_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latency(&self, system: &str) -> Option<LatencyStats> {
        self.systems.lock().get(system).map(SystemWindow::stats)
    }

    /// Check every system against the thresholds. New alerts are logged,
    /// kept in the recent list and returned.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate_alerts(&self, open_circuits: &[String]) -> Vec<Alert> {
        let now = self.clock.utc();
        let t = &self.thresholds;
        let mut raised = Vec::new();

        let stats: Vec<(String, LatencyStats)> = self
            .systems
            .lock()
            .iter()
            .map(|(system, window)| (system.clone(), window.stats()))
            .collect();
        for (system, stats) in stats {
            if stats.count < t.min_samples {
                continue;
            }
            if stats.error_rate > t.error_rate {
                raised.push(Alert {
                    kind: AlertKind::ErrorRate,
                    message: format!("error rate {:.1}% on {system}", stats.error_rate * 100.0),
                    system: system.clone(),
                    value: stats.error_rate,
                    threshold: t.error_rate,
                    raised_at: now,
                });
            }
            if stats.p95_ms > t.p95_latency_ms {
                raised.push(Alert {
                    kind: AlertKind::Latency,
                    message: format!("p95 latency {}ms on {system}", stats.p95_ms),
                    system,
                    value: stats.p95_ms as f64,
                    threshold: t.p95_latency_ms as f64,
                    raised_at: now,
                });
            }
        }
        if t.open_circuits {
            for system in open_circuits {
                raised.push(Alert {
                    kind: AlertKind::CircuitOpen,
                    system: system.clone(),
                    message: format!("circuit open for {system}"),
                    value: 1.0,
                    threshold: 0.0,
                    raised_at: now,
                });
            }
        }

        if !raised.is_empty() {
            let mut recent = self.alerts.lock();
            for alert in &raised {
                warn!(kind = ?alert.kind, system = %alert.system, value = alert.value, "{}", alert.message);
                if recent.len() == RECENT_ALERTS {
                    recent.pop_front();
                }
                recent.push_back(alert.clone());
            }
        }
        raised
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let systems = self
            .systems
            .lock()
            .iter()
            .map(|(system, window)| (system.clone(), window.stats()))
            .collect();
        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            circuit_transitions: self.circuit_transitions.load(Ordering::Relaxed),
            systems,
            recent_alerts: self.recent_alerts(),
        }
    }
}

/// Point-in-time copy of a [`MetricsCollector`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub rate_limited: u64,
    pub circuit_rejected: u64,
    pub auth_failures: u64,
    pub validation_failures: u64,
    pub circuit_transitions: u64,
    pub systems: BTreeMap<String, LatencyStats>,
    pub recent_alerts: Vec<Alert>,
}
