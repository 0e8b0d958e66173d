//! Basic example: a gateway over two echo systems, a rate limit, and a
//! two-step workflow.
//!
//! Run with: `cargo run -p conduit-gateway --example basic`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{Payload, Request, SearchPayload, Step, Workflow};
use conduit_executor::ExecutorConfig;
use conduit_gateway::{
    Endpoint, GatewayBuilder, RateLimitRule, SystemConfig, WorkflowConfig, WorkflowEngine,
};
use conduit_provider::EchoProvider;
use serde_json::json;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .init();

    let gateway = GatewayBuilder::new()
        .system(SystemConfig::new(
            "marketplace",
            vec![Endpoint::new("http://marketplace-1"), Endpoint::new("http://marketplace-2")],
        ))
        .provider(Arc::new(EchoProvider::new("marketplace")))
        .system(SystemConfig::new("cns", vec![Endpoint::new("http://cns-1")]))
        .provider(Arc::new(EchoProvider::new("cns")))
        .rate_limits(vec![RateLimitRule::new("user:*", 3, Duration::from_secs(60))])
        .executor_config(ExecutorConfig {
            max_retries: 1,
            execution_timeout: Duration::from_secs(5),
            max_concurrent: 10,
            ..ExecutorConfig::default()
        })
        .build()
        .expect("failed to build gateway");
    let gateway = Arc::new(gateway);

    // Scenario 1: the fourth request of one user within a minute is limited.
    println!("=== Scenario 1: Rate limited searches ===");
    for attempt in 1..=4 {
        let request = Request::new(
            "example",
            "marketplace.search",
            Payload::Search(SearchPayload {
                query: "gpu".into(),
                filters: serde_json::Map::new(),
                limit: Some(3),
            }),
        )
        .with_user("ada");
        let response = gateway.process_request(&request).await;
        println!(
            "  Request {attempt}: {:?} via {}",
            response.status,
            response
                .metadata
                .endpoint
                .as_deref()
                .or(response.error_code())
                .unwrap_or("-")
        );
    }
    println!();

    // Scenario 2: a workflow feeding one system's output into another.
    println!("=== Scenario 2: Workflow ===");
    let engine = WorkflowEngine::new(Arc::clone(&gateway), WorkflowConfig::default());
    engine
        .register_workflow(
            Workflow::new("search-and-validate")
                .with_step(Step::system_call("find", "marketplace.search").with_input("query", "{{workflow.input.q}}"))
                .with_step(
                    Step::system_call("check", "cns.validate")
                        .with_input("document", "{{steps.find.echo}}"),
                ),
        )
        .expect("workflow should be valid");
    let id = engine
        .execute_workflow("search-and-validate", json!({"q": "tpu"}), HashMap::new())
        .expect("workflow should start");
    engine.shutdown().await;

    if let Some(execution) = engine.get_execution(&id) {
        println!("  Execution {id}: {}", execution.status);
        for record in &execution.step_results {
            println!("    {} -> {:?} ({} attempt(s))", record.step_id, record.status, record.attempts);
        }
    }
    println!();

    let snap = gateway.metrics().snapshot();
    println!("=== Gateway Metrics ===");
    println!("  Total:         {}", snap.total);
    println!("  Succeeded:     {}", snap.succeeded);
    println!("  Rate limited:  {}", snap.rate_limited);
}
