use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use conduit_core::{Payload, Request, SearchPayload};
use conduit_executor::ExecutorConfig;
use conduit_gateway::{
    Endpoint, GatewayBuilder, LoadBalancerConfig, LoadBalancingStrategy, RateLimitRule, SystemConfig,
    TransformOp, TransformRule,
};
use conduit_provider::{DynProvider, ProviderError};
use serde_json::{Value, json};

struct BenchProvider {
    provider_name: String,
}

impl BenchProvider {
    fn new(name: &str) -> Self {
        Self {
            provider_name: name.to_owned(),
        }
    }
}

#[async_trait]
impl DynProvider for BenchProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn execute(&self, _request: &Request, endpoint: &str) -> Result<Value, ProviderError> {
        Ok(json!({"hits": [{"id": "a"}, {"id": "b"}], "endpoint": endpoint, "internal": true}))
    }

    async fn health_check(&self, _endpoint: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn search_request() -> Request {
    Request::new(
        "bench",
        "marketplace.search",
        Payload::Search(SearchPayload {
            query: "gpu".into(),
            filters: serde_json::Map::new(),
            limit: Some(10),
        }),
    )
    .with_user("bench-user")
}

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_retries: 0,
        execution_timeout: Duration::from_secs(5),
        max_concurrent: 100,
        ..ExecutorConfig::default()
    }
}

fn marketplace() -> SystemConfig {
    SystemConfig::new(
        "marketplace",
        vec![
            Endpoint::new("http://marketplace-1"),
            Endpoint::new("http://marketplace-2"),
            Endpoint::new("http://marketplace-3"),
        ],
    )
}

fn bench_process_minimal(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

    let gateway = GatewayBuilder::new()
        .system(marketplace())
        .provider(Arc::new(BenchProvider::new("marketplace")))
        .executor_config(executor_config())
        .build()
        .expect("gateway should build");

    c.bench_function("process_request_minimal", |b| {
        b.iter(|| {
            let request = search_request();
            rt.block_on(async {
                let response = gateway.process_request(black_box(&request)).await;
                black_box(response)
            })
        });
    });
}

fn bench_process_full_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

    let gateway = GatewayBuilder::new()
        .system(marketplace())
        .provider(Arc::new(BenchProvider::new("marketplace")))
        .executor_config(executor_config())
        .load_balancer(LoadBalancerConfig {
            strategy: LoadBalancingStrategy::LeastConnections,
            ..LoadBalancerConfig::default()
        })
        .rate_limits(vec![RateLimitRule::new("*", 1_000_000, Duration::from_secs(60))])
        .transform(
            TransformRule::new("strip-internal")
                .for_system("marketplace")
                .op(TransformOp::Remove {
                    path: "internal".into(),
                }),
        )
        .build()
        .expect("gateway should build");

    c.bench_function("process_request_full_pipeline", |b| {
        b.iter(|| {
            let request = search_request();
            rt.block_on(async {
                let response = gateway.process_request(black_box(&request)).await;
                black_box(response)
            })
        });
    });
}

criterion_group!(benches, bench_process_minimal, bench_process_full_pipeline);
criterion_main!(benches);
