use std::time::Duration;

use conduit_core::StepKind;
use conduit_gateway::{LoadBalancingStrategy, TransformOp};

use super::*;

#[test]
fn empty_file_yields_defaults() {
    let config = ConduitConfig::from_toml("").unwrap();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.server.shutdown_timeout_seconds, 30);
    assert!(config.systems.is_empty());
    assert!(config.rate_limit.enabled);
    assert!(config.rate_limit.to_rules().is_empty());
    assert!(!config.auth.enabled);
    assert_eq!(config.load_balancer.strategy, LoadBalancingStrategy::RoundRobin);
    assert_eq!(config.bus.tick_interval_ms, 100);
    assert!(config.workflows.is_empty());
}

#[test]
fn telemetry_defaults() {
    let config: TelemetryConfig = toml::from_str("").unwrap();
    assert!(!config.enabled);
    assert_eq!(config.filter_directives(), "info");
    assert_eq!(config.endpoint, "http://localhost:4317");
    assert_eq!(config.service_name, "conduit");
    assert!((config.sample_ratio - 1.0).abs() < f64::EPSILON);
    assert_eq!(config.protocol, ExportProtocol::Grpc);
    assert_eq!(config.timeout_seconds, 10);
}

#[test]
fn telemetry_component_levels_and_export() {
    let toml = r#"
        level = "warn"
        enabled = true
        endpoint = "http://collector:4318"
        sample_ratio = 0.25
        protocol = "http"

        [components]
        workflow = "debug"
        gateway = "info"
        http = "error"

        [resource_attributes]
        "deployment.environment" = "staging"
    "#;

    let config: TelemetryConfig = toml::from_str(toml).unwrap();
    assert!(config.enabled);
    assert_eq!(config.protocol, ExportProtocol::Http);
    assert!((config.sample_ratio - 0.25).abs() < f64::EPSILON);
    assert_eq!(
        config.filter_directives(),
        "warn,conduit_gateway=info,conduit_gateway::workflow=debug,tower_http=error"
    );
    assert_eq!(
        config.resource_attributes.get("deployment.environment").unwrap(),
        "staging"
    );
}

#[test]
fn telemetry_rejects_unknown_components_and_protocols() {
    assert!(toml::from_str::<TelemetryConfig>("[components]\nscheduler = \"debug\"").is_err());
    assert!(toml::from_str::<TelemetryConfig>("protocol = \"udp\"").is_err());
}

#[test]
fn systems_with_endpoints_and_overrides() {
    let toml = r#"
        [[systems]]
        name = "marketplace"
        provider = "http"
        headers = { "x-team" = "search" }
        endpoints = [
            { url = "http://mk-1:9000", weight = 3, zone = "eu-west" },
            { url = "http://mk-2:9000" },
        ]

        [systems.circuit_breaker]
        failure_threshold = 10
        timeout_seconds = 5

        [[systems]]
        name = "cns"
        endpoints = [{ url = "http://cns-1" }]
    "#;

    let config = ConduitConfig::from_toml(toml).unwrap();
    assert_eq!(config.systems.len(), 2);

    let marketplace = &config.systems[0];
    assert_eq!(marketplace.provider, ProviderKind::Http);
    assert_eq!(marketplace.headers["x-team"], "search");
    assert_eq!(marketplace.endpoints[0].weight, 3);
    assert_eq!(marketplace.endpoints[0].zone.as_deref(), Some("eu-west"));
    assert_eq!(marketplace.endpoints[1].weight, 1);
    assert_eq!(marketplace.endpoints[1].max_connections, 100);

    let merged = config
        .circuit_breaker
        .merged(marketplace.circuit_breaker.as_ref().unwrap());
    assert_eq!(merged.failure_threshold, 10);
    assert_eq!(merged.timeout, Duration::from_secs(5));
    assert_eq!(merged.success_threshold, 2);
    assert_eq!(merged.error_rate, Some(0.5));

    assert_eq!(config.systems[1].provider, ProviderKind::Echo);
    assert!(config.systems[1].circuit_breaker.is_none());
}

#[test]
fn routing_and_rate_limits() {
    let toml = r#"
        [routing]
        default_system = "cns"

        [[routing.rules]]
        pattern = "catalog.*"
        target = "marketplace"
        priority = 10
        tags = { tier = "gold" }

        [[routing.keyword_routes]]
        keyword = "validate"
        target = "cns"

        [[rate_limit.rules]]
        pattern = "user:*"
        requests = 100
        burst = 20

        [[rate_limit.rules]]
        pattern = "user:batch-*"
        requests = 10
        window_seconds = 1
    "#;

    let config = ConduitConfig::from_toml(toml).unwrap();
    assert_eq!(config.routing.default_system.as_deref(), Some("cns"));
    assert_eq!(config.routing.rules[0].priority, 10);
    assert_eq!(config.routing.rules[0].tags["tier"], "gold");
    assert_eq!(config.routing.keyword_routes[0].target, "cns");

    let rules = config.rate_limit.to_rules();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].window, Duration::from_secs(60));
    assert_eq!(rules[0].burst, Some(20));
    assert_eq!(rules[1].window, Duration::from_secs(1));
}

#[test]
fn disabled_rate_limit_installs_no_rules() {
    let toml = r#"
        [rate_limit]
        enabled = false

        [[rate_limit.rules]]
        pattern = "*"
        requests = 1
    "#;
    let config = ConduitConfig::from_toml(toml).unwrap();
    assert!(config.rate_limit.to_rules().is_empty());
}

#[test]
fn auth_transforms_and_load_balancer() {
    let toml = r#"
        [auth]
        enabled = true
        jwt_secret = "s3cret"

        [auth.role_permissions]
        analyst = ["cns:*"]

        [load_balancer]
        strategy = "custom"
        preferred_zone = "eu-west"
        unhealthy_threshold = 5

        [[transforms]]
        name = "flatten"
        system = "marketplace"
        ops = [
            { op = "rename", from = "items", to = "results" },
            { op = "remove", path = "debug" },
        ]
    "#;

    let config = ConduitConfig::from_toml(toml).unwrap();
    assert!(config.auth.enabled);
    assert_eq!(config.auth.role_permissions["analyst"], vec!["cns:*".to_owned()]);
    assert_eq!(config.load_balancer.strategy, LoadBalancingStrategy::Custom);
    assert_eq!(config.load_balancer.to_config().unhealthy_threshold, 5);
    assert_eq!(config.load_balancer.preferred_zone.as_deref(), Some("eu-west"));
    assert_eq!(config.transforms[0].operation, "*");
    assert!(matches!(config.transforms[0].ops[1], TransformOp::Remove { .. }));
}

#[test]
fn workflows_are_declared_inline() {
    let toml = r#"
        [[workflows]]
        id = "find-and-check"
        triggers = [{ type = "event", pattern = "catalog.updated" }]

        [[workflows.steps]]
        id = "find"
        type = "system-call"
        operation = "marketplace.search"
        input = { query = "{{workflow.input.q}}" }

        [[workflows.steps]]
        id = "gate"
        type = "conditional"
        halt_on_false = true
        conditions = [{ field = "steps.find.total", operator = "gt", value = 0 }]
    "#;

    let config = ConduitConfig::from_toml(toml).unwrap();
    let workflow = &config.workflows[0];
    assert_eq!(workflow.id.as_str(), "find-and-check");
    assert_eq!(workflow.version, "1.0.0");
    assert_eq!(workflow.steps[0].kind, StepKind::SystemCall);
    assert_eq!(workflow.steps[1].kind, StepKind::Conditional);
    assert!(workflow.steps[1].halt_on_false);
    assert!(workflow.validate().is_ok());
}

#[test]
fn engine_and_executor_sections_convert() {
    let toml = r"
        [executor]
        max_retries = 1
        execution_timeout_seconds = 2

        [workflow_engine]
        max_retained_executions = 10

        [background]
        enable_probes = false
    ";
    let config = ConduitConfig::from_toml(toml).unwrap();
    let executor = config.executor.to_config();
    assert_eq!(executor.max_retries, 1);
    assert_eq!(executor.execution_timeout, Duration::from_secs(2));
    assert_eq!(config.workflow_engine.to_config().max_retained_executions, 10);
    assert!(!config.background.to_config().enable_probes);
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = ConduitConfig::from_toml("[server\nport = 1").unwrap_err();
    assert!(matches!(err, ServerError::Config(_)));
}
