use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use conduit_core::EventMetadata;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct PublishBody {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_source() -> String {
    "http".to_owned()
}

/// `POST /v1/events`: enqueue an event; it is delivered on the next tick.
pub async fn publish(
    State(state): State<AppState>,
    Json(body): Json<PublishBody>,
) -> Result<impl IntoResponse, ServerError> {
    let metadata = body.correlation_id.map(|correlation_id| EventMetadata {
        correlation_id: Some(correlation_id),
        ..EventMetadata::default()
    });
    let id = state
        .runtime
        .bus()
        .publish(body.event_type, body.payload, body.source, metadata)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "event_id": id }))))
}

/// `GET /v1/events/handlers`
pub async fn handlers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.bus().list_handlers())
}

/// `GET /v1/events/health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "health": state.runtime.bus().health_check(),
        "stats": state.runtime.bus().stats(),
    }))
}

/// `GET /v1/events/dead-letters`
pub async fn dead_letters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.bus().dead_letters())
}

/// `POST /v1/events/dead-letters/{id}/reprocess`
pub async fn reprocess(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let event_id = state.runtime.bus().reprocess_dead_letter(&id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "event_id": event_id }))))
}
