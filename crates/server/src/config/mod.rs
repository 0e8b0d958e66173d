mod circuit_breaker;
mod load_balancer;
mod rate_limit;
mod routing;
mod runtime;
mod server;
mod systems;
mod telemetry;

#[cfg(test)]
mod tests;

pub use circuit_breaker::*;
pub use load_balancer::*;
pub use rate_limit::*;
pub use routing::*;
pub use runtime::*;
pub use server::*;
pub use systems::*;
pub use telemetry::*;

use std::path::Path;

use conduit_core::Workflow;
use conduit_gateway::{AlertThresholds, AuthConfig, TransformRule};
use serde::Deserialize;

use crate::error::ServerError;

/// Top-level configuration for the Conduit server, loaded from a TOML file.
///
/// Every section is optional, but the gateway refuses to start without at
/// least one `[[systems]]` entry.
#[derive(Debug, Default, Deserialize)]
pub struct ConduitConfig {
    /// HTTP server bind configuration.
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Backend systems and their endpoints.
    #[serde(default)]
    pub systems: Vec<SystemEntry>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Defaults for every system's circuit breaker.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerDefaults,
    #[serde(default)]
    pub load_balancer: LoadBalancerSection,
    /// Authentication and role permissions.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Response transformation rules, applied in order.
    #[serde(default)]
    pub transforms: Vec<TransformRule>,
    /// Alert thresholds of the metrics collector.
    #[serde(default)]
    pub metrics: AlertThresholds,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub background: BackgroundSection,
    #[serde(default)]
    pub workflow_engine: WorkflowSection,
    /// Workflows registered at startup.
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

impl ConduitConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ServerError> {
        toml::from_str(contents).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Load `path`, or the defaults when the file does not exist.
    ///
    /// The flag reports whether the file was found so the caller can log it
    /// once tracing is up.
    pub fn load(path: &Path) -> Result<(Self, bool), ServerError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok((Self::from_toml(&contents)?, true)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Self::default(), false)),
            Err(e) => Err(ServerError::Config(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}
