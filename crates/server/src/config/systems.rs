use std::collections::HashMap;

use serde::Deserialize;

use super::CircuitBreakerOverride;

/// Which provider implementation serves a system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Logs and echoes every request; no I/O.
    #[default]
    Echo,
    /// JSON POST to `<endpoint>/<operation>`.
    Http,
}

/// One backend system.
///
/// # Example
///
/// ```toml
/// [[systems]]
/// name = "marketplace"
/// provider = "http"
/// headers = { "x-team" = "search" }
/// endpoints = [
///     { url = "http://mk-1:9000", weight = 2, zone = "eu-west" },
///     { url = "http://mk-2:9000" },
/// ]
///
/// [systems.circuit_breaker]
/// failure_threshold = 10
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SystemEntry {
    pub name: String,
    #[serde(default)]
    pub provider: ProviderKind,
    pub endpoints: Vec<EndpointEntry>,
    /// Extra headers sent by the `http` provider.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Overrides of the `[circuit_breaker]` defaults for this system.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointEntry {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}
