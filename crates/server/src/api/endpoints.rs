use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::json;

use super::AppState;
use crate::error::ServerError;

/// `GET /v1/endpoints`: health of every endpoint, grouped by system.
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.gateway().load_balancer().all_health())
}

/// `GET /v1/rate-limits/{identifier}`: the bucket of one caller, e.g.
/// `user:ada`, without consuming a token.
pub async fn rate_limit(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let limiter = state
        .runtime
        .gateway()
        .rate_limiter()
        .ok_or_else(|| ServerError::NotFound("rate limiting is disabled".into()))?;
    match limiter.peek(&identifier) {
        Some(snapshot) => Ok(Json(json!(snapshot))),
        None => Err(ServerError::NotFound(format!("no bucket for {identifier}"))),
    }
}
