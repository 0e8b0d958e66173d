//! Tracing subscriber setup, with optional OTLP span export.
//!
//! The request pipeline, workflow executions and bus ticks are instrumented
//! with `tracing` spans; when telemetry is enabled those spans are bridged to
//! an `OpenTelemetry` collector alongside the usual `fmt` output.

use std::time::Duration;

use opentelemetry::trace::TracerProvider;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchSpanProcessor, Sampler, SdkTracerProvider};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{ExportProtocol, TelemetryConfig};

/// Keeps the tracer provider alive; call [`TelemetryGuard::shutdown`] to
/// flush pending spans before exit.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            warn!(error = %e, "tracer provider shutdown failed");
        }
    }
}

/// `RUST_LOG` wins over the configured levels. An invalid configured
/// filter degrades to `info`.
fn env_filter(config: &TelemetryConfig) -> (EnvFilter, Option<String>) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, None);
    }
    let directives = config.filter_directives();
    match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new("info"), Some(format!("invalid log filter '{directives}': {e}"))),
    }
}

fn init_fmt_only(config: &TelemetryConfig) -> TelemetryGuard {
    let (filter, problem) = env_filter(config);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    if let Some(problem) = problem {
        warn!("{problem}");
    }
    TelemetryGuard { provider: None }
}

/// Install the global subscriber.
///
/// A broken exporter configuration falls back to `fmt` output only and is
/// logged; it never stops the server from starting.
pub fn init(config: &TelemetryConfig) -> TelemetryGuard {
    if !config.enabled {
        return init_fmt_only(config);
    }

    let exporter = match build_exporter(config) {
        Ok(exporter) => exporter,
        Err(e) => {
            let guard = init_fmt_only(config);
            tracing::error!(
                error = %e,
                endpoint = %config.endpoint,
                protocol = %config.protocol,
                "failed to build OTLP exporter, spans will not be exported"
            );
            return guard;
        }
    };

    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_sampler(sampler_for(config.sample_ratio))
        .with_resource(resource_for(config))
        .build();
    global::set_tracer_provider(provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("conduit"));
    let (filter, problem) = env_filter(config);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();
    if let Some(problem) = problem {
        warn!("{problem}");
    }

    info!(
        endpoint = %config.endpoint,
        protocol = %config.protocol,
        sample_ratio = config.sample_ratio,
        "span export enabled"
    );
    TelemetryGuard {
        provider: Some(provider),
    }
}

fn sampler_for(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

fn resource_for(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("process.pid", std::process::id().to_string()),
    ];
    if let Ok(host) = std::env::var("HOSTNAME") {
        attributes.push(KeyValue::new("host.name", host));
    }
    attributes.extend(
        config
            .resource_attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
    );
    Resource::builder().with_attributes(attributes).build()
}

fn build_exporter(config: &TelemetryConfig) -> Result<SpanExporter, opentelemetry::trace::TraceError> {
    let timeout = Duration::from_secs(config.timeout_seconds);
    match config.protocol {
        ExportProtocol::Http => SpanExporter::builder()
            .with_http()
            .with_endpoint(&config.endpoint)
            .with_timeout(timeout)
            .build(),
        ExportProtocol::Grpc => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.endpoint)
            .with_timeout(timeout)
            .build(),
    }
}
