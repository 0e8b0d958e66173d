use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conduit_core::Clock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

const RECENT_FAILURES: usize = 100;
const RESPONSE_SAMPLES: usize = 100;
const HISTOGRAM_HOURS: i64 = 24;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests flow through.
    Closed,
    /// The system is failing; requests are rejected immediately.
    Open,
    /// Recovery probe; a limited number of requests test the system.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change, as `(from, to)`.
pub type Transition = (CircuitState, CircuitState);

/// Configuration for a per-system circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring period that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub timeout: Duration,
    /// Length of the rolling window for request and failure counts.
    pub monitoring_period: Duration,
    /// Minimum requests in the window before the circuit may open.
    pub volume_threshold: u32,
    /// Failure ratio in the window that opens the circuit.
    pub error_rate: Option<f64>,
}

impl CircuitBreakerConfig {
    /// Validate configuration values.
    ///
    /// `timeout = 0` is allowed, which makes the circuit probe on the next
    /// evaluation.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold < 1 {
            return Err("failure_threshold must be >= 1".into());
        }
        if self.success_threshold < 1 {
            return Err("success_threshold must be >= 1".into());
        }
        if self.monitoring_period.is_zero() {
            return Err("monitoring_period must be positive".into());
        }
        if let Some(rate) = self.error_rate
            && !(rate > 0.0 && rate <= 1.0)
        {
            return Err("error_rate must be in (0, 1]".into());
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(60),
            volume_threshold: 10,
            error_rate: Some(0.5),
        }
    }
}

/// One recorded failure, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

/// Response-time statistics over the recent samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseTimeStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyFailures {
    pub hour_start: DateTime<Utc>,
    pub failures: u64,
}

/// Diagnostic view of a breaker's recent failures.
#[derive(Debug, Clone, Serialize)]
pub struct FailureAnalysis {
    pub system: String,
    pub state: CircuitState,
    pub total_failures: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub response_times: ResponseTimeStats,
    /// The last 24 hours, oldest first.
    pub hourly_failures: Vec<HourlyFailures>,
    pub recent_errors: Vec<FailureRecord>,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub system: String,
    pub state: CircuitState,
    pub forced: bool,
    pub failure_count: u32,
    pub success_count: u32,
    pub request_count: u32,
    /// Half-open probes admitted and not yet reported.
    pub probes_in_flight: u32,
    /// Milliseconds until an open circuit will probe.
    pub retry_after_ms: Option<u64>,
}

struct CircuitData {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    window_start: Instant,
    next_attempt: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every entry into `HalfOpen`; permits from an earlier
    /// half-open period release nothing.
    half_open_epoch: u64,
    last_probe_at: Option<Instant>,
    forced: bool,
    total_failures: u64,
    recent_failures: VecDeque<FailureRecord>,
    response_times: VecDeque<f64>,
    /// `(hours since epoch, failures)`, oldest first.
    hourly: VecDeque<(i64, u64)>,
}

impl CircuitData {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            request_count: 0,
            window_start: now,
            next_attempt: None,
            probes_in_flight: 0,
            half_open_epoch: 0,
            last_probe_at: None,
            forced: false,
            total_failures: 0,
            recent_failures: VecDeque::new(),
            response_times: VecDeque::new(),
            hourly: VecDeque::new(),
        }
    }

    fn reset_counts(&mut self, now: Instant) {
        self.failure_count = 0;
        self.success_count = 0;
        self.request_count = 0;
        self.window_start = now;
        self.probes_in_flight = 0;
        self.last_probe_at = None;
    }

    fn roll_window(&mut self, now: Instant, period: Duration) {
        if self.state == CircuitState::Closed
            && now.saturating_duration_since(self.window_start) >= period
        {
            self.reset_counts(now);
        }
    }

    fn sample(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_SAMPLES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed.as_secs_f64() * 1000.0);
    }
}

/// Circuit breaker for a single backend system.
///
/// - `Closed` -> `Open` once the window holds at least `volume_threshold`
///   requests and either `failure_threshold` failures or a failure ratio of
///   at least `error_rate`
/// - `Open` -> `HalfOpen` on the first evaluation after `timeout`
/// - `HalfOpen` -> `Closed` after `success_threshold` consecutive successes
/// - `HalfOpen` -> `Open` on any failure
///
/// Half-open probes that report nothing for a whole `monitoring_period` are
/// released on the next evaluation, so a caller that never reports back
/// cannot hold the circuit half-open.
pub struct CircuitBreaker {
    system: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    data: RwLock<CircuitData>,
}

impl CircuitBreaker {
    pub fn new(system: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            system: system.into(),
            config,
            clock,
            data: RwLock::new(CircuitData::new(now)),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CircuitData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CircuitData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-evaluate time-based transitions. Run by the periodic tick and on
    /// every recorded failure.
    pub fn evaluate(&self) -> Option<Transition> {
        let now = self.clock.now();
        let mut data = self.write();
        self.evaluate_locked(&mut data, now)
    }

    fn evaluate_locked(&self, data: &mut CircuitData, now: Instant) -> Option<Transition> {
        match data.state {
            CircuitState::Closed => {
                if self.should_open(data) {
                    return Some(self.open(data, now, CircuitState::Closed));
                }
                if now.saturating_duration_since(data.window_start) >= self.config.monitoring_period {
                    data.reset_counts(now);
                }
                None
            }
            CircuitState::Open => {
                let due = !data.forced && data.next_attempt.is_some_and(|at| now >= at);
                if !due {
                    return None;
                }
                debug!(system = %self.system, "circuit breaker transitioning from open to half-open");
                data.state = CircuitState::HalfOpen;
                data.half_open_epoch += 1;
                data.reset_counts(now);
                Some((CircuitState::Open, CircuitState::HalfOpen))
            }
            CircuitState::HalfOpen => {
                let stale = data.probes_in_flight > 0
                    && data
                        .last_probe_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= self.config.monitoring_period);
                if stale {
                    warn!(
                        system = %self.system,
                        probes = data.probes_in_flight,
                        "releasing half-open probes that never reported"
                    );
                    data.probes_in_flight = 0;
                    data.last_probe_at = None;
                }
                None
            }
        }
    }

    fn should_open(&self, data: &CircuitData) -> bool {
        if data.request_count < self.config.volume_threshold || data.request_count == 0 {
            return false;
        }
        if data.failure_count >= self.config.failure_threshold {
            return true;
        }
        self.config
            .error_rate
            .is_some_and(|rate| f64::from(data.failure_count) / f64::from(data.request_count) >= rate)
    }

    fn open(&self, data: &mut CircuitData, now: Instant, from: CircuitState) -> Transition {
        info!(
            system = %self.system,
            failures = data.failure_count,
            requests = data.request_count,
            from = %from,
            "circuit breaker opening"
        );
        data.state = CircuitState::Open;
        data.next_attempt = Some(now + self.config.timeout);
        data.reset_counts(now);
        (from, CircuitState::Open)
    }

    /// Admit or reject a request.
    ///
    /// Open circuits fail with [`GatewayError::CircuitOpen`] carrying the
    /// time left until the next probe. Half-open circuits admit up to
    /// `success_threshold` concurrent probes. The returned [`Permit`] holds
    /// the probe slot until its outcome is reported or it is dropped.
    pub fn check_availability(&self) -> Result<Permit<'_>, GatewayError> {
        let now = self.clock.now();
        let mut data = self.write();
        let transition = self.evaluate_locked(&mut data, now);

        match data.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                transition,
                probe: None,
            }),
            CircuitState::HalfOpen if data.probes_in_flight < self.config.success_threshold => {
                data.probes_in_flight += 1;
                data.last_probe_at = Some(now);
                Ok(Permit {
                    breaker: self,
                    transition,
                    probe: Some(data.half_open_epoch),
                })
            }
            CircuitState::HalfOpen => Err(GatewayError::CircuitOpen {
                system: self.system.clone(),
                retry_after: Duration::from_secs(1),
            }),
            CircuitState::Open => Err(GatewayError::CircuitOpen {
                system: self.system.clone(),
                retry_after: data
                    .next_attempt
                    .map_or(self.config.timeout, |at| at.saturating_duration_since(now)),
            }),
        }
    }

    /// Give back a probe slot whose outcome will never be reported.
    fn abandon_probe(&self, epoch: u64) {
        let mut data = self.write();
        if data.state == CircuitState::HalfOpen && data.half_open_epoch == epoch {
            data.probes_in_flight = data.probes_in_flight.saturating_sub(1);
            debug!(system = %self.system, "half-open probe abandoned");
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, elapsed: Duration) -> Option<Transition> {
        let now = self.clock.now();
        let mut data = self.write();
        data.sample(elapsed);
        data.roll_window(now, self.config.monitoring_period);

        match data.state {
            CircuitState::Closed => {
                data.request_count += 1;
                None
            }
            CircuitState::HalfOpen => {
                data.success_count += 1;
                data.probes_in_flight = data.probes_in_flight.saturating_sub(1);
                if data.success_count >= self.config.success_threshold {
                    info!(
                        system = %self.system,
                        successes = data.success_count,
                        "circuit breaker closing after successful probes"
                    );
                    data.state = CircuitState::Closed;
                    data.next_attempt = None;
                    data.reset_counts(now);
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed call and re-evaluate immediately.
    ///
    /// `kind` groups failures in the analysis (usually an error code).
    pub fn record_failure(&self, kind: &str, message: &str, elapsed: Duration) -> Option<Transition> {
        let now = self.clock.now();
        let utc = self.clock.utc();
        let mut data = self.write();
        data.sample(elapsed);
        data.roll_window(now, self.config.monitoring_period);
        data.total_failures += 1;

        if data.recent_failures.len() == RECENT_FAILURES {
            data.recent_failures.pop_front();
        }
        data.recent_failures.push_back(FailureRecord {
            at: utc,
            kind: kind.to_owned(),
            message: message.to_owned(),
        });

        let hour = utc.timestamp().div_euclid(3600);
        match data.hourly.back_mut() {
            Some((h, count)) if *h == hour => *count += 1,
            _ => data.hourly.push_back((hour, 1)),
        }
        while data
            .hourly
            .front()
            .is_some_and(|(h, _)| *h <= hour - HISTOGRAM_HOURS)
        {
            data.hourly.pop_front();
        }

        match data.state {
            CircuitState::Closed => {
                data.request_count += 1;
                data.failure_count += 1;
                self.evaluate_locked(&mut data, now)
            }
            CircuitState::HalfOpen => {
                warn!(system = %self.system, "circuit breaker re-opening after half-open probe failure");
                Some(self.open(&mut data, now, CircuitState::HalfOpen))
            }
            CircuitState::Open => None,
        }
    }

    /// Open the circuit until [`force_close`](Self::force_close) or
    /// [`reset`](Self::reset).
    pub fn force_open(&self) -> Option<Transition> {
        let now = self.clock.now();
        let mut data = self.write();
        warn!(system = %self.system, "circuit breaker forced open");
        let from = data.state;
        data.forced = true;
        data.state = CircuitState::Open;
        data.next_attempt = None;
        data.reset_counts(now);
        (from != CircuitState::Open).then_some((from, CircuitState::Open))
    }

    /// Close the circuit and clear its window.
    pub fn force_close(&self) -> Option<Transition> {
        info!(system = %self.system, "circuit breaker forced closed");
        self.close_and_clear()
    }

    /// Reset to a fresh closed breaker. Diagnostics are kept.
    pub fn reset(&self) -> Option<Transition> {
        debug!(system = %self.system, "circuit breaker reset");
        self.close_and_clear()
    }

    fn close_and_clear(&self) -> Option<Transition> {
        let now = self.clock.now();
        let mut data = self.write();
        let from = data.state;
        data.forced = false;
        data.state = CircuitState::Closed;
        data.next_attempt = None;
        data.reset_counts(now);
        (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
    }

    /// Current state without triggering transitions.
    pub fn state(&self) -> CircuitState {
        self.read().state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let data = self.read();
        CircuitSnapshot {
            system: self.system.clone(),
            state: data.state,
            forced: data.forced,
            failure_count: data.failure_count,
            success_count: data.success_count,
            request_count: data.request_count,
            probes_in_flight: data.probes_in_flight,
            retry_after_ms: (data.state == CircuitState::Open)
                .then_some(data.next_attempt)
                .flatten()
                .map(|at| u64::try_from(at.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX)),
        }
    }

    pub fn failure_analysis(&self) -> FailureAnalysis {
        let utc = self.clock.utc();
        let data = self.read();

        let mut errors_by_kind = BTreeMap::new();
        for record in &data.recent_failures {
            *errors_by_kind.entry(record.kind.clone()).or_insert(0) += 1;
        }

        let current_hour = utc.timestamp().div_euclid(3600);
        let hourly_failures = (current_hour - HISTOGRAM_HOURS + 1..=current_hour)
            .map(|hour| HourlyFailures {
                hour_start: DateTime::from_timestamp(hour * 3600, 0).unwrap_or(utc),
                failures: data
                    .hourly
                    .iter()
                    .find(|(h, _)| *h == hour)
                    .map_or(0, |(_, count)| *count),
            })
            .collect();

        FailureAnalysis {
            system: self.system.clone(),
            state: data.state,
            total_failures: data.total_failures,
            errors_by_kind,
            response_times: response_stats(&data.response_times),
            hourly_failures,
            recent_errors: data.recent_failures.iter().rev().take(10).cloned().collect(),
        }
    }
}

/// Admission granted by [`CircuitBreaker::check_availability`].
///
/// Report the call with [`succeed`](Self::succeed) or [`fail`](Self::fail).
/// Dropping the permit unreported frees the half-open probe slot it holds
/// without counting as a success or a failure.
#[derive(Debug)]
#[must_use = "dropping a permit releases its probe slot immediately"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    transition: Option<Transition>,
    probe: Option<u64>,
}

impl Permit<'_> {
    /// The transition the admission check caused, if any.
    pub fn transition(&self) -> Option<Transition> {
        self.transition
    }

    /// Whether this permit holds a half-open probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn succeed(mut self, elapsed: Duration) -> Option<Transition> {
        self.probe = None;
        self.breaker.record_success(elapsed)
    }

    pub fn fail(mut self, kind: &str, message: &str, elapsed: Duration) -> Option<Transition> {
        self.probe = None;
        self.breaker.record_failure(kind, message, elapsed)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.probe.take() {
            self.breaker.abandon_probe(epoch);
        }
    }
}

fn response_stats(samples: &VecDeque<f64>) -> ResponseTimeStats {
    if samples.is_empty() {
        return ResponseTimeStats::default();
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    #[allow(clippy::cast_precision_loss)]
    let avg_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let p95_index = (sorted.len() * 95).div_ceil(100).saturating_sub(1);
    ResponseTimeStats {
        samples: sorted.len(),
        avg_ms,
        min_ms: sorted[0],
        max_ms: sorted[sorted.len() - 1],
        p95_ms: sorted[p95_index.min(sorted.len() - 1)],
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.read();
        f.debug_struct("CircuitBreaker")
            .field("system", &self.system)
            .field("config", &self.config)
            .field("state", &data.state)
            .field("failure_count", &data.failure_count)
            .field("request_count", &data.request_count)
            .finish_non_exhaustive()
    }
}

/// Circuit breakers for every configured system.
///
/// Built once with the gateway and then used immutably; each
/// [`CircuitBreaker`] handles its own internal mutability.
pub struct CircuitBreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: HashMap::new(),
            clock,
        }
    }

    pub fn register(&mut self, system: impl Into<String>, config: CircuitBreakerConfig) {
        let name = system.into();
        self.breakers.insert(
            name.clone(),
            CircuitBreaker::new(name, config, Arc::clone(&self.clock)),
        );
    }

    pub fn get(&self, system: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(system)
    }

    /// Sorted names of every system with a breaker.
    pub fn systems(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.breakers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the periodic evaluation on every breaker.
    pub fn evaluate_all(&self) -> Vec<(String, Transition)> {
        self.systems()
            .into_iter()
            .filter_map(|name| {
                let breaker = self.breakers.get(name)?;
                breaker.evaluate().map(|t| (name.to_owned(), t))
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.systems()
            .into_iter()
            .filter_map(|name| self.breakers.get(name).map(CircuitBreaker::snapshot))
            .collect()
    }

    /// Names of systems whose circuit is currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        self.systems()
            .into_iter()
            .filter(|name| {
                self.breakers
                    .get(*name)
                    .is_some_and(|b| b.state() == CircuitState::Open)
            })
            .map(str::to_owned)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("systems", &self.systems())
            .finish_non_exhaustive()
    }
}
