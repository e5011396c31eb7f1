use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::engine::types::{Run, RunStatus, RunSummary, WorkflowDef};
use crate::storage::RunFilter;

use super::AppState;
use super::errors::AppError;

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

// --- Request/response types ---

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub workflow_id: String,
    pub task: String,
}

#[derive(Serialize)]
pub struct CreateRunResponse {
    pub id: String,
    pub run_token: String,
    pub status: RunStatus,
}

impl From<&Run> for CreateRunResponse {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            run_token: run.run_token.clone(),
            status: run.status,
        }
    }
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    #[serde(rename = "workflowId")]
    pub workflow_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummary>,
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub output: String,
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// --- Operator endpoints ---

/// GET /definitions
pub async fn list_definitions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WorkflowDef>>, AppError> {
    Ok(Json(state.store.list_defs().await?))
}

/// POST /definitions
pub async fn save_definition(
    State(state): State<Arc<AppState>>,
    Json(def): Json<WorkflowDef>,
) -> Result<Json<WorkflowDef>, AppError> {
    state.store.save_def(&def).await?;
    Ok(Json(def))
}

/// GET /definitions/{id}
pub async fn get_definition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDef>, AppError> {
    state
        .store
        .get_def(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("workflow definition '{id}' not found")))
}

/// DELETE /definitions/{id}
pub async fn delete_definition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.delete_def(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// GET /runs?workflowId=&status=
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<ListRunsResponse>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: anyhow::Error| AppError::BadRequest(e.to_string()))?;

    let filter = RunFilter {
        workflow_id: params.workflow_id,
        status,
    };
    let runs = state.store.list_runs(filter).await?;
    Ok(Json(ListRunsResponse { runs }))
}

/// POST /runs
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Json<CreateRunResponse>, AppError> {
    let def = state
        .store
        .get_def(&req.workflow_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow definition '{}' not found", req.workflow_id)))?;

    let run = state.engine.start_run(&def, req.task).await?;
    Ok(Json(CreateRunResponse::from(&run)))
}

/// GET /runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    state
        .store
        .get_run(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("run '{id}' not found")))
}

/// POST /runs/{id}/pause
pub async fn pause_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    Ok(Json(state.engine.pause_run(&id).await?))
}

/// POST /runs/{id}/resume
pub async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    Ok(Json(state.engine.resume_run(&id).await?))
}

/// DELETE /runs/{id} — cancels the run; does not purge its record.
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    Ok(Json(state.engine.cancel_run(&id).await?))
}

// --- Agent endpoints ---

/// POST /claim/{agentId}
pub async fn claim_step(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ClaimRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let _ = body;
    let token = bearer_token(&headers);
    let result = state.engine.claim_step(&agent_id, token.as_deref()).await?;
    Ok(Json(serde_json::to_value(result).unwrap()))
}

/// POST /complete/{stepId}
pub async fn complete_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = bearer_token(&headers);
    let result = state
        .engine
        .complete_step(&step_id, req.output, token.as_deref())
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap()))
}

/// POST /fail/{stepId}
pub async fn fail_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<FailRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = bearer_token(&headers);
    let result = state
        .engine
        .fail_step(&step_id, req.error, token.as_deref())
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap()))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
