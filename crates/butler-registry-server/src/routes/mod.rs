//! Route table for the three API surfaces.

use axum::Router;
use axum::routing::{get, patch, post};

use crate::state::AppState;

pub mod api;
pub mod callbacks;
pub mod helm;
pub mod webhooks;

/// Assemble the full router: public webhooks, executor callbacks, and the
/// registry API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Public, signature-gated, rate limited by source IP.
        .route("/webhooks/{provider}", post(webhooks::receive))
        .route("/helm/{namespace}/index.yaml", get(helm::index))
        // Executor callbacks, `brce_` tokens only.
        .route("/callbacks/v1/runs/{id}", get(callbacks::get_run))
        .route("/callbacks/v1/runs/{id}/status", patch(callbacks::update_status))
        .route("/callbacks/v1/runs/{id}/logs", post(callbacks::append_logs))
        .route("/callbacks/v1/runs/{id}/plan", post(callbacks::upload_plan))
        .route(
            "/callbacks/v1/runs/{id}/outputs",
            post(callbacks::upload_outputs),
        )
        // Registry API, `breg_` tokens only.
        .route(
            "/api/v1/artifacts",
            post(api::create_artifact).get(api::list_artifacts),
        )
        .route(
            "/api/v1/artifacts/{id}",
            get(api::get_artifact).patch(api::update_artifact),
        )
        .route(
            "/api/v1/artifacts/{id}/versions",
            post(api::publish_version).get(api::list_versions),
        )
        .route(
            "/api/v1/artifacts/{id}/versions/{version}/download",
            get(api::download_version),
        )
        .route("/api/v1/versions/{id}/approve", post(api::approve_version))
        .route("/api/v1/versions/{id}/reject", post(api::reject_version))
        .route("/api/v1/versions/{id}/yank", post(api::yank_version))
        .route("/api/v1/versions/{id}/ci", post(api::report_ci))
        .route("/api/v1/policies", post(api::create_policy))
        .route("/api/v1/environments", post(api::create_environment))
        .route(
            "/api/v1/environments/{id}/lock",
            post(api::lock_environment),
        )
        .route(
            "/api/v1/environments/{id}/runs",
            post(api::create_environment_run),
        )
        .route(
            "/api/v1/environment-runs/{id}",
            get(api::get_environment_run),
        )
        .route("/api/v1/modules", post(api::create_module))
        .route(
            "/api/v1/modules/{id}/dependencies",
            post(api::create_dependency),
        )
        .route("/api/v1/modules/{id}/runs", post(api::create_run))
        .route("/api/v1/modules/{id}/queue", get(api::module_queue))
        .route("/api/v1/runs/{id}", get(api::get_run))
        .route("/api/v1/runs/{id}/plan", get(api::get_run_plan))
        .route("/api/v1/runs/{id}/logs", get(api::get_run_logs))
        .route("/api/v1/runs/{id}/confirm", post(api::confirm_run))
        .route("/api/v1/runs/{id}/discard", post(api::discard_run))
        .route("/api/v1/runs/{id}/cancel", post(api::cancel_run))
        .with_state(state)
}
