pub mod auth;
pub mod circuits;
pub mod endpoints;
pub mod events;
pub mod health;
pub mod requests;
pub mod workflows;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::runtime::Runtime;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

/// Build the router.
///
/// `/health`, `/metrics` and `/v1/requests` are public: the request route
/// authenticates every call through the gateway itself. Everything else is
/// an admin surface guarded by [`auth::require_admin`].
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/v1/requests", post(requests::process));

    let admin = Router::new()
        .route("/stats", get(health::stats))
        // Workflows
        .route(
            "/v1/workflows",
            get(workflows::list_workflows).post(workflows::register_workflow),
        )
        .route("/v1/workflows/{id}", get(workflows::get_workflow))
        .route("/v1/workflows/{id}/execute", post(workflows::execute))
        .route("/v1/executions", get(workflows::list_executions))
        .route("/v1/executions/{id}", get(workflows::get_execution))
        .route("/v1/executions/{id}/cancel", post(workflows::cancel))
        // Event bus
        .route("/v1/events", post(events::publish))
        .route("/v1/events/handlers", get(events::handlers))
        .route("/v1/events/health", get(events::health))
        .route("/v1/events/dead-letters", get(events::dead_letters))
        .route(
            "/v1/events/dead-letters/{id}/reprocess",
            post(events::reprocess),
        )
        // Resilience
        .route("/v1/circuits", get(circuits::list))
        .route("/v1/circuits/{system}/analysis", get(circuits::analysis))
        .route("/v1/circuits/{system}/open", post(circuits::open))
        .route("/v1/circuits/{system}/close", post(circuits::close))
        .route("/v1/circuits/{system}/reset", post(circuits::reset))
        .route("/v1/endpoints", get(endpoints::list))
        .route("/v1/rate-limits/{identifier}", get(endpoints::rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    public
        .merge(admin)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
