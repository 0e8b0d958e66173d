use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-handler circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOptions {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker blocks invocations.
    pub reset_timeout: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// A small two-state breaker guarding one subscription.
///
/// Unlike the system breakers in the gateway there is no half-open probe
/// budget: once the reset timeout elapses the next invocation runs and the
/// failure count starts over.
#[derive(Debug)]
pub struct HandlerBreaker {
    options: BreakerOptions,
    state: Mutex<BreakerState>,
}

impl HandlerBreaker {
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            options,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether an invocation may run at `now`. Closes the breaker when its
    /// reset timeout has elapsed.
    pub fn allow(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        match state.open_until {
            Some(until) if now < until => false,
            Some(_) => {
                *state = BreakerState::default();
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    /// Count a failure. Returns `true` when this failure opened the breaker.
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.open_until.is_none()
            && state.consecutive_failures >= self.options.failure_threshold.max(1)
        {
            state.open_until = Some(now + self.options.reset_timeout);
            return true;
        }
        false
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.state.lock().open_until.is_some_and(|until| now < until)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> HandlerBreaker {
        HandlerBreaker::new(BreakerOptions {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(10),
        })
    }

    #[test]
    fn opens_at_threshold() {
        let b = breaker(2);
        let now = Instant::now();
        assert!(!b.record_failure(now));
        assert!(b.allow(now));
        assert!(b.record_failure(now));
        assert!(b.is_open(now));
        assert!(!b.allow(now));
    }

    #[test]
    fn success_resets_the_count() {
        let b = breaker(2);
        let now = Instant::now();
        b.record_failure(now);
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        assert!(!b.record_failure(now));
    }

    #[test]
    fn closes_after_reset_timeout() {
        let b = breaker(1);
        let now = Instant::now();
        b.record_failure(now);
        assert!(!b.allow(now + Duration::from_secs(9)));
        assert!(b.allow(now + Duration::from_secs(10)));
        assert!(!b.is_open(now + Duration::from_secs(10)));
        assert_eq!(b.consecutive_failures(), 0);
    }
}
