//! Request gateway for Conduit.
//!
//! A [`Gateway`] takes every inbound [`Request`](conduit_core::Request)
//! through validation, authentication, rate limiting, routing, circuit
//! breaking and load balancing before dispatching it to a provider. The
//! [`WorkflowEngine`] chains such requests into multi-step executions.

pub mod auth;
pub mod background;
pub mod builder;
pub mod circuit_breaker;
pub mod error;
pub mod gateway;
mod glob;
pub mod load_balancer;
pub mod metrics;
pub mod rate_limiter;
pub mod router;
pub mod transformer;
pub mod workflow;

pub use auth::{ApiKeyEntry, AuthConfig, AuthenticationService, hash_api_key};
pub use background::{BackgroundConfig, BackgroundProcessor};
pub use builder::{GatewayBuilder, SystemConfig};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState, Permit,
};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayHealth, GatewayStats, SystemHealth};
pub use load_balancer::{
    ConnectionGuard, Endpoint, EndpointHealth, EndpointSelector, LoadBalancer, LoadBalancerConfig, LoadBalancingStrategy,
    LocalityPreference,
};
pub use metrics::{Alert, AlertThresholds, MetricsCollector, MetricsSnapshot};
pub use rate_limiter::{RateLimitRule, RateLimitSnapshot, RateLimiter};
pub use router::{KeywordRoute, RequestRouter, RouteCondition, RoutingRule, RoutingRuleSpec};
pub use transformer::{ResponseTransformer, TransformOp, TransformRule};
pub use workflow::{CustomStep, WorkflowConfig, WorkflowEngine, WorkflowError};
