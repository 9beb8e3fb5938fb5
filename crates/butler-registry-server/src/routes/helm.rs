//! Helm repository index, served through the short-TTL cache.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

use butler_registry::RegistryError;
use butler_registry::types::{ApprovalStatus, ArtifactFilter, ArtifactType};

use crate::auth::client_key;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct IndexEntry {
    name: String,
    version: String,
    created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    urls: Vec<String>,
}

/// `GET /helm/{namespace}/index.yaml`
pub async fn index(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    state
        .webhook_limiter
        .check(&client_key(&headers, remote))?;

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let cached = match state.helm_cache.get(&namespace) {
        Some(entry) => entry,
        None => {
            let content = render_index(&state, &namespace)?;
            let etag = state.helm_cache.set(&namespace, content.clone());
            butler_registry::helm_cache::CachedIndex { content, etag }
        }
    };

    if if_none_match.as_deref() == Some(cached.etag.as_str()) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    Ok((
        StatusCode::OK,
        [
            (header::ETAG, cached.etag),
            (header::CONTENT_TYPE, "application/yaml".to_string()),
        ],
        cached.content,
    )
        .into_response())
}

/// Render `index.yaml` over every approved, non-yanked chart version in
/// the namespace.
fn render_index(state: &AppState, namespace: &str) -> ApiResult<String> {
    let charts = state.store.list_artifacts(&ArtifactFilter {
        artifact_type: Some(ArtifactType::HelmChart),
        limit: Some(200),
        ..ArtifactFilter::default()
    })?;

    let mut entries: BTreeMap<String, Vec<IndexEntry>> = BTreeMap::new();
    for chart in charts.items.into_iter().filter(|c| c.namespace == namespace) {
        let versions = state
            .store
            .list_versions(chart.id)?
            .into_iter()
            .filter(|v| v.approval_status == ApprovalStatus::Approved && !v.is_bad)
            .map(|v| IndexEntry {
                name: chart.name.clone(),
                version: v.version,
                created: v.created_at,
                digest: v.digest,
                urls: v.storage_ref.into_iter().collect(),
            })
            .collect::<Vec<_>>();
        if !versions.is_empty() {
            entries.insert(chart.name.clone(), versions);
        }
    }

    let document = json!({
        "apiVersion": "v1",
        "generated": Utc::now(),
        "entries": entries,
    });
    serde_yaml::to_string(&document)
        .map_err(|err| ApiError(RegistryError::Internal(format!("index render: {err}"))))
}
