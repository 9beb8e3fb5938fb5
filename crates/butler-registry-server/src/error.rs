//! HTTP mapping of core error kinds.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use butler_registry::RegistryError;

/// Wrapper giving core errors an HTTP rendering.
#[derive(Debug)]
pub struct ApiError(pub RegistryError);

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Storage/internal detail stays in the logs, not the response.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
            return (
                status,
                Json(json!({"error": "internal", "message": "internal error"})),
            )
                .into_response();
        }

        let body = match &self.0 {
            RegistryError::PolicyFail { results } => {
                json!({"error": "policy_failed", "message": self.0.to_string(), "results": results})
            }
            other => json!({"error": error_code(other), "message": other.to_string()}),
        };
        let mut response = (status, Json(body)).into_response();
        if let RegistryError::RateLimited { retry_after_secs } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn error_code(err: &RegistryError) -> &'static str {
    match err {
        RegistryError::InvalidInput(_) => "invalid_input",
        RegistryError::Unauthorized(_) => "unauthorized",
        RegistryError::Forbidden(_) => "forbidden",
        RegistryError::NotFound(_) => "not_found",
        RegistryError::Conflict(_) => "conflict",
        RegistryError::IllegalTransition { .. } => "illegal_transition",
        RegistryError::PolicyFail { .. } => "policy_failed",
        RegistryError::RateLimited { .. } => "rate_limited",
        RegistryError::UpstreamNotReady(_) => "upstream_not_ready",
        RegistryError::UpstreamOutputMissing { .. } => "upstream_output_missing",
        RegistryError::DependencyCycle => "dependency_cycle",
        RegistryError::Transport(_) => "transport_failure",
        RegistryError::Storage(_) | RegistryError::Internal(_) => "internal",
    }
}

/// Handler result alias.
pub type ApiResult<T> = Result<T, ApiError>;
