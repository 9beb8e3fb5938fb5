//! Executor callback endpoints, authenticated by per-run `brce_` tokens.
//!
//! Callbacks are idempotent: updates against a run that already reached a
//! terminal status are acknowledged with 200 and change nothing, so the
//! executor never retries into an error loop.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use butler_registry::RegistryError;
use butler_registry::runs;
use butler_registry::store::RunUpdate;
use butler_registry::types::RunStatus;

use crate::auth::callback_run;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub resources_added: Option<i64>,
    #[serde(default)]
    pub resources_changed: Option<i64>,
    #[serde(default)]
    pub resources_destroyed: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// `PATCH /callbacks/v1/runs/{id}/status`
pub async fn update_status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<impl IntoResponse> {
    let run = callback_run(state.store.as_ref(), &headers, run_id)?;
    if run.status.is_terminal() {
        return Ok(Json(json!({"message": "run already terminal", "status": run.status})));
    }
    let to = RunStatus::parse(&update.status).ok_or_else(|| {
        ApiError(RegistryError::InvalidInput(format!(
            "unknown run status {:?}",
            update.status
        )))
    })?;
    let updated = runs::transition_run(
        state.store.as_ref(),
        run_id,
        to,
        &RunUpdate {
            exit_code: update.exit_code,
            resources_added: update.resources_added,
            resources_changed: update.resources_changed,
            resources_destroyed: update.resources_destroyed,
            error_message: update.error_message,
            skipped_due_to: None,
        },
    )?;
    Ok(Json(json!({"message": "updated", "status": updated.status})))
}

#[derive(Debug, Deserialize)]
pub struct LogChunk {
    pub chunk: String,
}

/// `POST /callbacks/v1/runs/{id}/logs`
pub async fn append_logs(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<LogChunk>,
) -> ApiResult<impl IntoResponse> {
    let run = callback_run(state.store.as_ref(), &headers, run_id)?;
    if !run.status.is_terminal() {
        state.store.append_run_log(run_id, &body.chunk)?;
    }
    Ok(Json(json!({"message": "ok"})))
}

#[derive(Debug, Deserialize)]
pub struct PlanUpload {
    pub plan: String,
}

/// `POST /callbacks/v1/runs/{id}/plan`
pub async fn upload_plan(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<PlanUpload>,
) -> ApiResult<impl IntoResponse> {
    let run = callback_run(state.store.as_ref(), &headers, run_id)?;
    if !run.status.is_terminal() {
        state.store.set_run_plan(run_id, &body.plan)?;
    }
    Ok(Json(json!({"message": "ok"})))
}

#[derive(Debug, Deserialize)]
pub struct OutputsUpload {
    pub outputs: Value,
}

/// `POST /callbacks/v1/runs/{id}/outputs`
pub async fn upload_outputs(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<OutputsUpload>,
) -> ApiResult<impl IntoResponse> {
    let run = callback_run(state.store.as_ref(), &headers, run_id)?;
    if !run.status.is_terminal() {
        state.store.set_run_outputs(run_id, &body.outputs)?;
    }
    Ok(Json(json!({"message": "ok"})))
}

/// `GET /callbacks/v1/runs/{id}` — status polling for cancellation and
/// confirmation observation.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let run = callback_run(state.store.as_ref(), &headers, run_id)?;
    Ok(Json(json!({
        "run_id": run.id,
        "status": run.status,
        "operation": run.operation,
        "variables": run.variables,
        "state_backend": run.state_backend,
        "tf_version": run.tf_version,
    })))
}
