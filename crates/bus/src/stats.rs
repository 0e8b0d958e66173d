use std::sync::atomic::{AtomicU64, Ordering};

use conduit_core::HandlerId;
use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct BusStats {
    pub published: AtomicU64,
    pub processed: AtomicU64,
    pub unrouted: AtomicU64,
    pub invocations: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub skipped: AtomicU64,
}

impl BusStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStatsSnapshot {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Events delivered to at least one handler.
    pub processed: u64,
    /// Events drained with no matching subscription.
    pub unrouted: u64,
    pub invocations: u64,
    /// Deliveries that failed with no retry left.
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Invocations skipped by an open handler breaker.
    pub skipped: u64,
    pub queue_size: usize,
    pub pending_retries: usize,
    pub handler_count: usize,
    pub dead_letter_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of [`EventBus::health_check`](crate::EventBus::health_check).
#[derive(Debug, Clone, Serialize)]
pub struct BusHealth {
    pub status: HealthStatus,
    pub queue_size: usize,
    pub pending_retries: usize,
    pub open_breakers: Vec<HandlerId>,
    pub failing_handlers: Vec<HandlerId>,
    pub issues: Vec<String>,
}
