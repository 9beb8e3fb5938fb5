//! Registry API endpoints, authenticated by `breg_` tokens.
//!
//! This is a thin surface: handlers validate input, delegate to the engine,
//! and map results to JSON. The token's name doubles as the acting identity
//! recorded in approvals and audit entries.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use butler_registry::types::{
    ArtifactFilter, ArtifactStatus, ArtifactType, AuditEntry, CiKind, CiResult,
    EnvironmentOperation, ModuleDependency, NewArtifact, NewModule, Operation, OutputMapping,
    PolicyRules, PolicyScope, ScanGrade, is_valid_slug,
};
use butler_registry::{RegistryError, dag, ingest, queue, runs, store::RunUpdate};
use chrono::Utc;

use crate::auth::registry_actor;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError(RegistryError::InvalidInput(message.into()))
}

fn not_found(what: impl std::fmt::Display) -> ApiError {
    ApiError(RegistryError::NotFound(what.to_string()))
}

/// Invalidate the Helm index cache when a helm-chart version changes
/// status in a namespace.
fn maybe_invalidate_helm(state: &AppState, artifact_type: ArtifactType, namespace: &str) {
    if artifact_type == ArtifactType::HelmChart {
        state.helm_cache.invalidate(namespace);
    }
}

// --- Artifacts ---

/// `POST /api/v1/artifacts`
pub async fn create_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewArtifact>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    state.api_limiter.check(&actor.id.to_string())?;
    if !is_valid_slug(&new.namespace) {
        return Err(invalid(format!("invalid namespace {:?}", new.namespace)));
    }
    if !is_valid_slug(&new.name) {
        return Err(invalid(format!("invalid name {:?}", new.name)));
    }
    let artifact = state.store.insert_artifact(&new)?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    pub status: Option<String>,
    pub team: Option<String>,
    pub category: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

/// `GET /api/v1/artifacts`
pub async fn list_artifacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    state.api_limiter.check(&actor.id.to_string())?;
    let artifact_type = params
        .artifact_type
        .as_deref()
        .map(|t| ArtifactType::parse(t).ok_or_else(|| invalid(format!("unknown type {t:?}"))))
        .transpose()?;
    let status = params
        .status
        .as_deref()
        .map(|s| ArtifactStatus::parse(s).ok_or_else(|| invalid(format!("unknown status {s:?}"))))
        .transpose()?;
    let page = state.store.list_artifacts(&ArtifactFilter {
        artifact_type,
        status,
        team: params.team,
        category: params.category,
        cursor: params.cursor,
        limit: params.limit,
    })?;
    Ok(Json(page))
}

/// `GET /api/v1/artifacts/{id}`
pub async fn get_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    let artifact = state
        .store
        .get_artifact(id)?
        .ok_or_else(|| not_found(format!("artifact {id}")))?;
    Ok(Json(artifact))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactUpdate {
    pub status: String,
}

/// `PATCH /api/v1/artifacts/{id}` — deprecate or archive an artifact.
pub async fn update_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ArtifactUpdate>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    let status = ArtifactStatus::parse(&body.status)
        .ok_or_else(|| invalid(format!("unknown status {:?}", body.status)))?;
    state.store.update_artifact_status(id, status)?;
    let artifact = state
        .store
        .get_artifact(id)?
        .ok_or_else(|| not_found(format!("artifact {id}")))?;
    Ok(Json(artifact))
}

// --- Versions ---

#[derive(Debug, Deserialize)]
pub struct PublishVersion {
    pub version: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub changelog: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub storage_ref: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
}

/// `POST /api/v1/artifacts/{id}/versions`
pub async fn publish_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(artifact_id): Path<Uuid>,
    Json(body): Json<PublishVersion>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    state.api_limiter.check(&actor.id.to_string())?;
    let artifact = state
        .store
        .get_artifact(artifact_id)?
        .ok_or_else(|| not_found(format!("artifact {artifact_id}")))?;
    let parsed = butler_semver::Version::parse(&body.version)
        .map_err(|err| invalid(err.to_string()))?;

    let (row, created) = state.store.upsert_version(&butler_registry::types::NewVersion {
        artifact_id,
        version: parsed.raw.clone(),
        digest: body.digest,
        changelog: body.changelog,
        metadata: body.metadata.unwrap_or_else(|| json!({})),
        storage_ref: body.storage_ref,
        size_bytes: body.size_bytes,
        published_by: Some(actor.name.clone()),
    })?;
    if created {
        let entry = AuditEntry::new(actor.name.clone(), "version.published", "version")
            .resource(artifact.id, artifact.name.clone())
            .version_str(&row.version);
        if let Err(err) = state.store.append_audit(&entry) {
            tracing::warn!(%err, "failed to record publish audit");
        }
        maybe_invalidate_helm(&state, artifact.artifact_type, &artifact.namespace);
    }
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(row)))
}

/// `GET /api/v1/artifacts/{id}/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(artifact_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    Ok(Json(state.store.list_versions(artifact_id)?))
}

fn version_and_artifact(
    state: &AppState,
    version_id: Uuid,
) -> ApiResult<(butler_registry::types::VersionRow, butler_registry::types::Artifact)> {
    let version = state
        .store
        .get_version(version_id)?
        .ok_or_else(|| not_found(format!("version {version_id}")))?;
    let artifact = state
        .store
        .get_artifact(version.artifact_id)?
        .ok_or_else(|| ApiError(RegistryError::Internal("version without artifact".into())))?;
    Ok((version, artifact))
}

/// `POST /api/v1/versions/{id}/approve`
pub async fn approve_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(version_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    state.api_limiter.check(&actor.id.to_string())?;
    let (_, artifact) = version_and_artifact(&state, version_id)?;
    let outcome = ingest::approve_version_gated(state.store.as_ref(), version_id, &actor.name)?;
    maybe_invalidate_helm(&state, artifact.artifact_type, &artifact.namespace);
    Ok(Json(json!({
        "version": outcome.version,
        "evaluation": outcome.evaluation,
        "cascade": outcome.cascade,
    })))
}

/// `POST /api/v1/versions/{id}/reject`
pub async fn reject_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(version_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    let (_, artifact) = version_and_artifact(&state, version_id)?;
    let rejected = state.store.reject_version(version_id, &actor.name)?;
    maybe_invalidate_helm(&state, artifact.artifact_type, &artifact.namespace);
    let entry = AuditEntry::new(actor.name, "version.rejected", "version")
        .resource(artifact.id, artifact.name)
        .version_str(&rejected.version);
    if let Err(err) = state.store.append_audit(&entry) {
        tracing::warn!(%err, "failed to record reject audit");
    }
    Ok(Json(rejected))
}

/// `POST /api/v1/versions/{id}/yank`
pub async fn yank_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(version_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    let (_, artifact) = version_and_artifact(&state, version_id)?;
    let yanked = state.store.yank_version(version_id)?;
    maybe_invalidate_helm(&state, artifact.artifact_type, &artifact.namespace);
    let entry = AuditEntry::new(actor.name, "version.yanked", "version")
        .resource(artifact.id, artifact.name)
        .version_str(&yanked.version);
    if let Err(err) = state.store.append_audit(&entry) {
        tracing::warn!(%err, "failed to record yank audit");
    }
    Ok(Json(yanked))
}

#[derive(Debug, Deserialize)]
pub struct CiReport {
    pub kind: String,
    pub success: bool,
    #[serde(default)]
    pub grade: Option<String>,
}

/// `POST /api/v1/versions/{id}/ci`
pub async fn report_ci(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(version_id): Path<Uuid>,
    Json(report): Json<CiReport>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    let kind = CiKind::parse(&report.kind)
        .ok_or_else(|| invalid(format!("unknown CI kind {:?}", report.kind)))?;
    let grade = report
        .grade
        .as_deref()
        .map(|g| ScanGrade::parse(g).ok_or_else(|| invalid(format!("unknown grade {g:?}"))))
        .transpose()?;
    state.store.insert_ci_result(&CiResult {
        version_id,
        kind,
        success: report.success,
        grade,
        created_at: Utc::now(),
    })?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/artifacts/{id}/versions/{version}/download`
pub async fn download_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((artifact_id, version)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    state.api_limiter.check(&actor.id.to_string())?;
    let artifact = state
        .store
        .get_artifact(artifact_id)?
        .ok_or_else(|| not_found(format!("artifact {artifact_id}")))?;
    let row = state
        .store
        .find_version(artifact_id, &version)?
        .ok_or_else(|| not_found(format!("version {version}")))?;
    let evaluation = ingest::gate_download(state.store.as_ref(), &artifact, &row, &actor.name)?;
    Ok(Json(json!({
        "storage_ref": row.storage_ref,
        "digest": row.digest,
        "evaluation": evaluation,
    })))
}

// --- Policies ---

#[derive(Debug, Deserialize)]
pub struct NewPolicyBinding {
    pub scope: String,
    #[serde(default)]
    pub scope_ref: Option<String>,
    pub rules: PolicyRules,
}

/// `POST /api/v1/policies`
pub async fn create_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewPolicyBinding>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    let scope = match (body.scope.as_str(), body.scope_ref) {
        ("artifact", Some(id)) => PolicyScope::Artifact(
            Uuid::parse_str(&id).map_err(|_| invalid("scope_ref must be an artifact id"))?,
        ),
        ("namespace", Some(ns)) => PolicyScope::Namespace(ns),
        ("team", Some(team)) => PolicyScope::Team(team),
        ("global", None) => PolicyScope::Global,
        (scope, _) => return Err(invalid(format!("invalid scope {scope:?}"))),
    };
    let binding = state.store.insert_policy_binding(&scope, &body.rules)?;
    Ok((StatusCode::CREATED, Json(binding)))
}

// --- Environments & modules ---

#[derive(Debug, Deserialize)]
pub struct NewEnvironment {
    pub name: String,
    #[serde(default)]
    pub cloud_integration: Option<Value>,
}

/// `POST /api/v1/environments`
pub async fn create_environment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewEnvironment>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    if !is_valid_slug(&body.name) {
        return Err(invalid(format!("invalid environment name {:?}", body.name)));
    }
    let environment = state
        .store
        .insert_environment(&body.name, body.cloud_integration.as_ref())?;
    Ok((StatusCode::CREATED, Json(environment)))
}

#[derive(Debug, Deserialize)]
pub struct LockRequest {
    pub locked: bool,
}

/// `POST /api/v1/environments/{id}/lock`
pub async fn lock_environment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(environment_id): Path<Uuid>,
    Json(body): Json<LockRequest>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    state
        .store
        .set_environment_locked(environment_id, body.locked)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/modules`
pub async fn create_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewModule>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    if !is_valid_slug(&new.name) {
        return Err(invalid(format!("invalid module name {:?}", new.name)));
    }
    let module = state.store.insert_module(&new)?;
    Ok((StatusCode::CREATED, Json(module)))
}

#[derive(Debug, Deserialize)]
pub struct NewDependency {
    pub depends_on_id: Uuid,
    #[serde(default)]
    pub output_mapping: Vec<OutputMapping>,
}

/// `POST /api/v1/modules/{id}/dependencies`
pub async fn create_dependency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module_id): Path<Uuid>,
    Json(body): Json<NewDependency>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    state.store.insert_dependency(&ModuleDependency {
        module_id,
        depends_on_id: body.depends_on_id,
        output_mapping: body.output_mapping,
    })?;
    Ok(StatusCode::CREATED)
}

// --- Runs ---

#[derive(Debug, Deserialize)]
pub struct NewRunRequest {
    pub operation: String,
}

/// `POST /api/v1/modules/{id}/runs`
pub async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module_id): Path<Uuid>,
    Json(body): Json<NewRunRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    state.api_limiter.check(&actor.id.to_string())?;
    let operation = Operation::parse(&body.operation)
        .ok_or_else(|| invalid(format!("unknown operation {:?}", body.operation)))?;
    let module = state
        .store
        .get_module(module_id)?
        .ok_or_else(|| not_found(format!("module {module_id}")))?;
    let outcome = queue::enqueue_user_run(state.store.as_ref(), &module, operation, &actor.name)?;
    Ok((StatusCode::CREATED, Json(outcome.run)))
}

/// `GET /api/v1/modules/{id}/queue`
pub async fn module_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    Ok(Json(json!({
        "active": queue::active(state.store.as_ref(), module_id)?,
        "queued_count": queue::queued_count(state.store.as_ref(), module_id)?,
    })))
}

/// `GET /api/v1/runs/{id}`
pub async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    let run = state
        .store
        .get_run(run_id)?
        .ok_or_else(|| not_found(format!("run {run_id}")))?;
    Ok(Json(run))
}

/// `GET /api/v1/runs/{id}/plan`
pub async fn get_run_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    let plan = state
        .store
        .get_run_plan(run_id)?
        .ok_or_else(|| not_found(format!("no plan for run {run_id}")))?;
    Ok(Json(json!({"plan": plan})))
}

/// `GET /api/v1/runs/{id}/logs`
pub async fn get_run_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    Ok(Json(json!({"chunks": state.store.list_run_logs(run_id)?})))
}

/// `POST /api/v1/runs/{id}/confirm`
pub async fn confirm_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    Ok(Json(runs::confirm_run(state.store.as_ref(), run_id)?))
}

/// `POST /api/v1/runs/{id}/discard`
pub async fn discard_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    Ok(Json(runs::discard_run(
        state.store.as_ref(),
        run_id,
        Some(format!("discarded by {}", actor.name)),
    )?))
}

/// `POST /api/v1/runs/{id}/cancel`
pub async fn cancel_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    Ok(Json(runs::cancel_run(
        state.store.as_ref(),
        run_id,
        &RunUpdate {
            error_message: Some(format!("cancelled by {}", actor.name)),
            ..RunUpdate::default()
        },
    )?))
}

// --- Environment runs ---

#[derive(Debug, Deserialize)]
pub struct NewEnvironmentRun {
    pub operation: String,
}

/// `POST /api/v1/environments/{id}/runs`
pub async fn create_environment_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(environment_id): Path<Uuid>,
    Json(body): Json<NewEnvironmentRun>,
) -> ApiResult<impl IntoResponse> {
    let actor = registry_actor(state.store.as_ref(), &headers)?;
    state.api_limiter.check(&actor.id.to_string())?;
    // Unknown operations degrade to a plan-all, never something mutating.
    let operation =
        EnvironmentOperation::parse(&body.operation).unwrap_or(EnvironmentOperation::PlanAll);
    let env_run = dag::start_environment_run(
        state.store.as_ref(),
        environment_id,
        operation,
        &actor.name,
        state.config.dispatch.confirmation_timeout,
    )?;
    Ok((StatusCode::CREATED, Json(env_run)))
}

/// `GET /api/v1/environment-runs/{id}`
pub async fn get_environment_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    registry_actor(state.store.as_ref(), &headers)?;
    let env_run = state
        .store
        .get_environment_run(id)?
        .ok_or_else(|| not_found(format!("environment run {id}")))?;
    let members = state.store.list_runs_for_environment_run(id)?;
    Ok(Json(json!({"run": env_run, "modules": members})))
}
