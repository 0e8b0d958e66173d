//! Per-identifier request limiting.
//!
//! Each identifier (`user:alice`, `resource:cns.validate`, ...) gets a lazily
//! created bucket governed by the most specific matching rule. A bucket
//! counts requests in a fixed window; rules with a burst allowance also keep
//! a refilling token count. The window is authoritative: once its counter
//! reaches the limit the identifier stays blocked until the window ends,
//! whatever the token count says.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conduit_core::Clock;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::GatewayError;

/// A limit applied to identifiers matching `pattern`.
///
/// Patterns are resolved most-specific-first: an exact identifier, then the
/// longest `prefix*` pattern, then the global `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub pattern: String,
    pub requests: u32,
    pub window: Duration,
    /// Extra tokens above `requests` available for bursts.
    pub burst: Option<u32>,
}

impl RateLimitRule {
    pub fn new(pattern: impl Into<String>, requests: u32, window: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            requests,
            window,
            burst: None,
        }
    }

    #[must_use]
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pattern.is_empty() {
            return Err("rate limit pattern must not be empty".into());
        }
        if self.requests == 0 {
            return Err(format!("rate limit '{}' allows zero requests", self.pattern));
        }
        if self.window.is_zero() {
            return Err(format!("rate limit '{}' has a zero window", self.pattern));
        }
        Ok(())
    }

    /// Match strength against `identifier`, higher is more specific.
    fn specificity(&self, identifier: &str) -> Option<(u8, usize)> {
        if self.pattern == identifier {
            return Some((3, identifier.len()));
        }
        if self.pattern == "*" {
            return Some((1, 0));
        }
        self.pattern
            .strip_suffix('*')
            .filter(|prefix| identifier.starts_with(prefix))
            .map(|prefix| (2, prefix.len()))
    }

    fn capacity(&self) -> f64 {
        f64::from(self.requests) + f64::from(self.burst.unwrap_or(0))
    }

    fn refill_per_sec(&self) -> f64 {
        f64::from(self.requests) / self.window.as_secs_f64()
    }
}

/// Current standing of one identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitSnapshot {
    pub identifier: String,
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after_ms: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Bucket {
    rule: usize,
    request_count: u32,
    window_start: Instant,
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl Bucket {
    fn new(rule_index: usize, rule: &RateLimitRule, now: Instant) -> Self {
        Self {
            rule: rule_index,
            request_count: 0,
            window_start: now,
            tokens: rule.capacity(),
            last_refill: now,
            blocked_until: None,
            last_seen: now,
        }
    }

    fn window_end(&self, rule: &RateLimitRule) -> Instant {
        self.window_start + rule.window
    }

    fn refresh(&mut self, rule: &RateLimitRule, now: Instant) {
        if now >= self.window_end(rule) {
            self.request_count = 0;
            self.window_start = now;
            self.blocked_until = None;
        }
        if rule.burst.is_some() {
            let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rule.refill_per_sec()).min(rule.capacity());
            self.last_refill = now;
        }
        self.last_seen = now;
    }

    fn is_limited(&mut self, rule: &RateLimitRule, now: Instant) -> bool {
        self.refresh(rule, now);
        if self.blocked_until.is_some_and(|until| now < until) {
            return true;
        }
        if self.request_count >= rule.requests {
            self.blocked_until = Some(self.window_end(rule));
            return true;
        }
        rule.burst.is_some() && self.tokens < 1.0
    }

    fn retry_after(&self, rule: &RateLimitRule, now: Instant) -> Duration {
        let window_wait = self
            .blocked_until
            .unwrap_or_else(|| self.window_end(rule))
            .saturating_duration_since(now);
        if self.request_count < rule.requests && rule.burst.is_some() && self.tokens < 1.0 {
            let token_wait = Duration::from_secs_f64((1.0 - self.tokens) / rule.refill_per_sec());
            return token_wait.min(window_wait);
        }
        window_wait
    }
}

/// Fixed-window limiter with optional token-bucket bursts.
#[derive(Debug)]
pub struct RateLimiter {
    rules: Vec<RateLimitRule>,
    buckets: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(rules: Vec<RateLimitRule>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules,
            buckets: DashMap::new(),
            clock,
        }
    }

    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    fn rule_index(&self, identifier: &str) -> Option<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter_map(|(i, rule)| rule.specificity(identifier).map(|s| (s, i)))
            .max_by_key(|(s, _)| *s)
            .map(|(_, i)| i)
    }

    /// The rule governing `identifier`, if any.
    pub fn rule_for(&self, identifier: &str) -> Option<&RateLimitRule> {
        self.rule_index(identifier).map(|i| &self.rules[i])
    }

    /// Whether the next request for `identifier` would be refused.
    /// Identifiers without a matching rule are never limited.
    pub fn is_limited(&self, identifier: &str) -> bool {
        self.check(identifier).is_err()
    }

    /// Like [`is_limited`](Self::is_limited), returning the error the
    /// gateway reports.
    pub fn check(&self, identifier: &str) -> Result<(), GatewayError> {
        let Some(index) = self.rule_index(identifier) else {
            return Ok(());
        };
        let rule = &self.rules[index];
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(identifier.to_owned())
            .or_insert_with(|| Bucket::new(index, rule, now));
        if bucket.is_limited(rule, now) {
            return Err(GatewayError::RateLimited {
                identifier: identifier.to_owned(),
                limit: rule.requests,
                retry_after: bucket.retry_after(rule, now),
            });
        }
        Ok(())
    }

    /// Count one request against `identifier`.
    ///
    /// Fails with [`GatewayError::RateLimited`] without counting when the
    /// identifier is limited.
    pub fn consume_token(&self, identifier: &str) -> Result<RateLimitSnapshot, GatewayError> {
        self.consume(identifier).map(|(snapshot, _)| snapshot)
    }

    /// Count one request against every identifier, or against none.
    ///
    /// All identifiers are checked first. If one is limited by the time it
    /// is consumed (a concurrent caller took the last slot), the requests
    /// already counted for the others are refunded.
    pub fn consume_all(&self, identifiers: &[String]) -> Result<Vec<RateLimitSnapshot>, GatewayError> {
        for id in identifiers {
            self.check(id)?;
        }
        let mut consumed: Vec<(&str, Option<Instant>)> = Vec::with_capacity(identifiers.len());
        let mut snapshots = Vec::with_capacity(identifiers.len());
        for id in identifiers {
            match self.consume(id) {
                Ok((snapshot, window)) => {
                    consumed.push((id.as_str(), window));
                    snapshots.push(snapshot);
                }
                Err(e) => {
                    for (id, window) in consumed {
                        if let Some(window) = window {
                            self.refund(id, window);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(snapshots)
    }

    /// Returns the snapshot and the start of the window the request was
    /// counted in (`None` when no rule applies).
    fn consume(&self, identifier: &str) -> Result<(RateLimitSnapshot, Option<Instant>), GatewayError> {
        let Some(index) = self.rule_index(identifier) else {
            return Ok((self.unlimited_snapshot(identifier), None));
        };
        let rule = &self.rules[index];
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(identifier.to_owned())
            .or_insert_with(|| Bucket::new(index, rule, now));

        if bucket.is_limited(rule, now) {
            debug!(identifier, limit = rule.requests, "rate limited");
            return Err(GatewayError::RateLimited {
                identifier: identifier.to_owned(),
                limit: rule.requests,
                retry_after: bucket.retry_after(rule, now),
            });
        }

        bucket.request_count += 1;
        if rule.burst.is_some() {
            bucket.tokens -= 1.0;
        }
        Ok((self.snapshot_of(identifier, rule, &bucket, now), Some(bucket.window_start)))
    }

    /// Undo one counted request, unless its window has already rolled.
    fn refund(&self, identifier: &str, window_start: Instant) {
        let Some(mut bucket) = self.buckets.get_mut(identifier) else {
            return;
        };
        let Some(rule) = self.rules.get(bucket.rule) else {
            return;
        };
        if bucket.window_start != window_start {
            return;
        }
        bucket.request_count = bucket.request_count.saturating_sub(1);
        if rule.burst.is_some() {
            bucket.tokens = (bucket.tokens + 1.0).min(rule.capacity());
        }
        if bucket.request_count < rule.requests {
            bucket.blocked_until = None;
        }
        debug!(identifier, "refunded rate-limit slot");
    }

    /// Current standing of `identifier` without counting a request.
    pub fn peek(&self, identifier: &str) -> Option<RateLimitSnapshot> {
        let bucket = self.buckets.get(identifier)?;
        let rule = self.rules.get(bucket.rule)?;
        Some(self.snapshot_of(identifier, rule, &bucket, self.clock.now()))
    }

    /// Drop buckets untouched for at least `idle`. Returns how many went.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < idle);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "swept idle rate-limit buckets");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn snapshot_of(
        &self,
        identifier: &str,
        rule: &RateLimitRule,
        bucket: &Bucket,
        now: Instant,
    ) -> RateLimitSnapshot {
        let reset_after = bucket.window_end(rule).saturating_duration_since(now);
        RateLimitSnapshot {
            identifier: identifier.to_owned(),
            current: bucket.request_count,
            limit: rule.requests,
            remaining: rule.requests.saturating_sub(bucket.request_count),
            reset_after_ms: u64::try_from(reset_after.as_millis()).unwrap_or(u64::MAX),
            reset_at: self.clock.utc()
                + chrono::Duration::from_std(reset_after).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    fn unlimited_snapshot(&self, identifier: &str) -> RateLimitSnapshot {
        RateLimitSnapshot {
            identifier: identifier.to_owned(),
            current: 0,
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_after_ms: 0,
            reset_at: self.clock.utc(),
        }
    }
}
