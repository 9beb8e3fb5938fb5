//! Public webhook endpoints.
//!
//! Every delivery is answered 200 with a generic message regardless of the
//! internal outcome — a hostile caller learns nothing beyond the endpoint's
//! existence. Verification runs over the raw body bytes exactly as
//! received; JSON parsing happens only afterwards.

use std::net::SocketAddr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::auth::client_key;
use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /webhooks/{provider}`
pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    state
        .webhook_limiter
        .check(&client_key(&headers, remote))?;

    let accepted = Json(json!({"message": "accepted"}));

    let Some(secret) = state.config.webhooks.secret_for(&provider) else {
        // Unknown or unconfigured provider: same response, no processing.
        return Ok(accepted);
    };

    let header_value = butler_webhook::signature_header(&provider)
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok());
    if !butler_webhook::verify(&provider, secret, header_value, &body) {
        debug!(%provider, "webhook signature verification failed");
        return Ok(accepted);
    }

    let Some(event) = butler_webhook::parse_push(&provider, &body) else {
        debug!(%provider, "webhook payload is not a push event");
        return Ok(accepted);
    };

    match butler_registry::ingest::ingest_push(state.store.as_ref(), &event) {
        Ok(summary) if summary.created_versions > 0 => {
            info!(
                repository = %event.repository_full_name,
                created = summary.created_versions,
                auto_approved = summary.auto_approved,
                "webhook ingested"
            );
            invalidate_helm_namespaces(&state, &event.repository_url);
        }
        Ok(_) => {}
        Err(err) => warn!(%err, repository = %event.repository_full_name, "webhook ingest failed"),
    }
    Ok(accepted)
}

/// Helm indexes memoize per namespace; a chart version landing via webhook
/// invalidates the namespaces of every matching chart artifact.
fn invalidate_helm_namespaces(state: &AppState, repository_url: &str) {
    let artifacts = match state.store.find_artifacts_by_repository_url(repository_url) {
        Ok(artifacts) => artifacts,
        Err(err) => {
            warn!(%err, "failed to look up artifacts for helm invalidation");
            return;
        }
    };
    for artifact in artifacts {
        if artifact.artifact_type == butler_registry::types::ArtifactType::HelmChart {
            state.helm_cache.invalidate(&artifact.namespace);
        }
    }
}
