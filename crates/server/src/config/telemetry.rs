use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Deserialize;

/// Log filtering and optional span export.
///
/// `level` and `components` build the log filter when `RUST_LOG` is unset.
/// With `enabled = true` the `gateway.process_request`, `workflow.execute`
/// and bus tick spans are also exported over OTLP.
///
/// ```toml
/// [telemetry]
/// level = "info"
/// enabled = true
/// endpoint = "http://localhost:4317"
/// protocol = "grpc"
///
/// [telemetry.components]
/// workflow = "debug"
/// bus = "warn"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Level for everything without a component override.
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-component level overrides.
    #[serde(default)]
    pub components: BTreeMap<Component, String>,
    /// Export spans over OTLP.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Fraction of traces kept, clamped to `[0, 1]`.
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
    #[serde(default)]
    pub protocol: ExportProtocol,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
}

impl TelemetryConfig {
    /// `EnvFilter` directives: the base level, then one per component.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.clone()];
        directives.extend(
            self.components
                .iter()
                .map(|(component, level)| format!("{}={level}", component.target())),
        );
        directives.join(",")
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            enabled: false,
            endpoint: default_endpoint(),
            service_name: default_service_name(),
            sample_ratio: default_sample_ratio(),
            protocol: ExportProtocol::default(),
            timeout_seconds: default_timeout_seconds(),
            resource_attributes: HashMap::new(),
        }
    }
}

/// A part of conduit whose log level can be set on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// The request pipeline: routing, limits, breakers, endpoints.
    Gateway,
    Workflow,
    Bus,
    Executor,
    Provider,
    /// HTTP handlers and request tracing.
    Http,
}

impl Component {
    /// The `tracing` target prefix the component logs under.
    pub fn target(self) -> &'static str {
        match self {
            Self::Gateway => "conduit_gateway",
            Self::Workflow => "conduit_gateway::workflow",
            Self::Bus => "conduit_bus",
            Self::Executor => "conduit_executor",
            Self::Provider => "conduit_provider",
            Self::Http => "tower_http",
        }
    }
}

/// OTLP transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportProtocol {
    #[default]
    Grpc,
    Http,
}

impl fmt::Display for ExportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grpc => f.write_str("grpc"),
            Self::Http => f.write_str("http"),
        }
    }
}

fn default_level() -> String {
    "info".to_owned()
}

fn default_endpoint() -> String {
    "http://localhost:4317".to_owned()
}

fn default_service_name() -> String {
    "conduit".to_owned()
}

fn default_sample_ratio() -> f64 {
    1.0
}

fn default_timeout_seconds() -> u64 {
    10
}
