use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use conduit_gateway::{CircuitBreaker, CircuitSnapshot};
use tracing::info;

use super::AppState;
use crate::error::ServerError;

/// `GET /v1/circuits`
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.gateway().circuit_breakers().snapshots())
}

/// `GET /v1/circuits/{system}/analysis`
pub async fn analysis(
    State(state): State<AppState>,
    Path(system): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let analysis = with_breaker(&state, &system, CircuitBreaker::failure_analysis)?;
    Ok(Json(analysis))
}

/// `POST /v1/circuits/{system}/open`: hold the circuit open until closed or
/// reset.
pub async fn open(
    State(state): State<AppState>,
    Path(system): Path<String>,
) -> Result<Json<CircuitSnapshot>, ServerError> {
    apply(&state, &system, "open", |b| {
        b.force_open();
    })
}

/// `POST /v1/circuits/{system}/close`
pub async fn close(
    State(state): State<AppState>,
    Path(system): Path<String>,
) -> Result<Json<CircuitSnapshot>, ServerError> {
    apply(&state, &system, "close", |b| {
        b.force_close();
    })
}

/// `POST /v1/circuits/{system}/reset`: closed, counters cleared, override
/// lifted.
pub async fn reset(
    State(state): State<AppState>,
    Path(system): Path<String>,
) -> Result<Json<CircuitSnapshot>, ServerError> {
    apply(&state, &system, "reset", |b| {
        b.reset();
    })
}

fn with_breaker<T>(
    state: &AppState,
    system: &str,
    f: impl FnOnce(&CircuitBreaker) -> T,
) -> Result<T, ServerError> {
    state
        .runtime
        .gateway()
        .circuit_breakers()
        .get(system)
        .map(f)
        .ok_or_else(|| ServerError::NotFound(format!("no circuit breaker for system {system}")))
}

fn apply(
    state: &AppState,
    system: &str,
    action: &str,
    f: impl FnOnce(&CircuitBreaker),
) -> Result<Json<CircuitSnapshot>, ServerError> {
    let snapshot = with_breaker(state, system, |breaker| {
        f(breaker);
        breaker.snapshot()
    })?;
    info!(system, action, state = %snapshot.state, "circuit breaker changed by operator");
    Ok(Json(snapshot))
}
