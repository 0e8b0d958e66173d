use std::time::Duration;

/// How long to wait before each retry.
///
/// Every variant is capped by its maximum so the delay never grows without
/// bound.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// `base * multiplier^n`, optionally spread with deterministic jitter.
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
        /// Stretch the delay by 0-40% depending on the attempt so concurrent
        /// callers do not retry in lockstep.
        jitter: bool,
    },
    /// `delay * (n + 1)`.
    Linear { delay: Duration, max: Duration },
    /// The same delay every time.
    Constant { delay: Duration },
}

impl RetryStrategy {
    /// Plain exponential backoff without jitter.
    pub fn exponential(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self::Exponential {
            base,
            max,
            multiplier,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (zero-based: `0` is the wait after
    /// the first failed attempt).
    ///
    /// ```
    /// use std::time::Duration;
    /// use conduit_executor::RetryStrategy;
    ///
    /// let backoff = RetryStrategy::exponential(
    ///     Duration::from_millis(100),
    ///     2.0,
    ///     Duration::from_secs(1),
    /// );
    /// assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
    /// assert_eq!(backoff.delay_for(3), Duration::from_millis(800));
    /// assert_eq!(backoff.delay_for(9), Duration::from_secs(1));
    /// ```
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Self::Exponential {
                base,
                max,
                multiplier,
                jitter,
            } => {
                // Retry counts are small; the cast cannot wrap in practice.
                #[allow(clippy::cast_possible_wrap)]
                let mut secs = base.as_secs_f64() * multiplier.powi(retry as i32);
                if *jitter {
                    secs *= 1.0 + 0.1 * f64::from(retry % 5);
                }
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
            Self::Linear { delay, max } => {
                let secs = delay.as_secs_f64() * f64::from(retry + 1);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
            Self::Constant { delay } => *delay,
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}
