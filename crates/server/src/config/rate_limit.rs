use std::time::Duration;

use conduit_gateway::RateLimitRule;
use serde::Deserialize;

/// Token-bucket limits keyed by caller identity (`user:<id>`).
///
/// # Example
///
/// ```toml
/// [rate_limit]
/// enabled = true
///
/// [[rate_limit.rules]]
/// pattern = "user:*"
/// requests = 100
/// window_seconds = 60
/// burst = 20
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<RateLimitRuleEntry>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitRuleEntry {
    /// Identifier glob, first match wins.
    pub pattern: String,
    pub requests: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Extra tokens allowed on top of `requests`.
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitConfig {
    /// The rules to install, or none when limiting is disabled.
    pub fn to_rules(&self) -> Vec<RateLimitRule> {
        if !self.enabled {
            return Vec::new();
        }
        self.rules
            .iter()
            .map(|entry| {
                let rule = RateLimitRule::new(
                    entry.pattern.clone(),
                    entry.requests,
                    Duration::from_secs(entry.window_seconds),
                );
                match entry.burst {
                    Some(burst) => rule.with_burst(burst),
                    None => rule,
                }
            })
            .collect()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_window_seconds() -> u64 {
    60
}
