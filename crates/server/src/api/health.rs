use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use conduit_bus::HealthStatus;
use serde_json::json;

use super::AppState;

/// `GET /health`: gateway and bus health combined.
///
/// Answers 503 only when the gateway itself is unhealthy; a degraded state
/// still reports 200 so load balancers keep routing traffic here.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = state.runtime.gateway().health();
    let bus = state.runtime.bus().health_check();
    let code = if gateway.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(json!({
            "status": gateway.status,
            "uptime_secs": gateway.uptime_secs,
            "systems": gateway.systems,
            "bus": bus,
            "active_executions": state.runtime.engine().active_count(),
        })),
    )
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.runtime.gateway().metrics().snapshot();
    (StatusCode::OK, Json(snapshot))
}

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "gateway": state.runtime.gateway().stats(),
            "bus": state.runtime.bus().stats(),
        })),
    )
}
