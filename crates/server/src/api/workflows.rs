use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use conduit_core::Workflow;
use conduit_gateway::WorkflowError;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::AppState;
use super::auth::credential_from;
use crate::error::ServerError;

/// `GET /v1/workflows`
pub async fn list_workflows(State(state): State<AppState>) -> impl IntoResponse {
    let workflows: Vec<Workflow> = state
        .runtime
        .engine()
        .workflows()
        .iter()
        .map(|w| (**w).clone())
        .collect();
    Json(workflows)
}

/// `POST /v1/workflows`: register or replace a workflow definition.
pub async fn register_workflow(
    State(state): State<AppState>,
    Json(workflow): Json<Workflow>,
) -> Result<impl IntoResponse, ServerError> {
    let id = workflow.id.clone();
    state.runtime.engine().register_workflow(workflow)?;
    info!(workflow_id = %id, "workflow registered via api");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// `GET /v1/workflows/{id}`
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let workflow = state
        .runtime
        .engine()
        .workflow(&id)
        .ok_or(WorkflowError::NotFound(id))?;
    Ok(Json((*workflow).clone()))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `POST /v1/workflows/{id}/execute`
///
/// Starts the execution in the background and answers 202 with its id. The
/// caller's credential, if any, is attached to every system step.
pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> Result<impl IntoResponse, ServerError> {
    let engine = state.runtime.engine();
    let execution_id = match credential_from(&headers) {
        Some(credential) => engine.execute_workflow_as(&id, body.input, body.metadata, credential)?,
        None => engine.execute_workflow(&id, body.input, body.metadata)?,
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "execution_id": execution_id, "workflow_id": id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionQuery {
    pub workflow_id: Option<String>,
}

/// `GET /v1/executions[?workflow_id=]`
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionQuery>,
) -> impl IntoResponse {
    Json(state.runtime.engine().list_executions(query.workflow_id.as_deref()))
}

/// `GET /v1/executions/{id}`
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let execution = state
        .runtime
        .engine()
        .get_execution(&id)
        .ok_or(WorkflowError::ExecutionNotFound(id))?;
    Ok(Json(execution))
}

/// `POST /v1/executions/{id}/cancel`
///
/// `cancelled` is false when the execution had already finished.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let cancelled = state.runtime.engine().cancel_execution(&id)?;
    Ok(Json(json!({ "execution_id": id, "cancelled": cancelled })))
}
