//! Bearer-token authentication for the two API surfaces.
//!
//! The prefix boundary runs before any database lookup: a `brce_` token can
//! never authenticate against registry CRUD and a `breg_` token can never
//! authenticate a run callback. Tokens with neither prefix are legacy and
//! fall through to the hash lookup on both surfaces.

use axum::http::HeaderMap;
use uuid::Uuid;

use butler_registry::RegistryError;
use butler_registry::store::Store;
use butler_registry::types::{ApiToken, ModuleRun};
use butler_token::TokenKind;

use crate::error::ApiError;

fn bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(butler_token::extract_bearer)
        .ok_or_else(|| {
            ApiError(RegistryError::Unauthorized(
                "missing bearer token".to_string(),
            ))
        })
}

/// Authenticate a registry API request, returning the token record whose
/// name doubles as the acting identity.
pub fn registry_actor(store: &dyn Store, headers: &HeaderMap) -> Result<ApiToken, ApiError> {
    let token = bearer(headers)?;
    if butler_token::classify(token) == TokenKind::Callback {
        // Callback tokens are rejected here before any lookup.
        return Err(ApiError(RegistryError::Unauthorized(
            "callback tokens are not valid for registry endpoints".to_string(),
        )));
    }
    let hash = butler_token::hash_token(token);
    store
        .find_api_token_by_hash(&hash)?
        .ok_or_else(|| ApiError(RegistryError::Unauthorized("unknown token".to_string())))
}

/// Authenticate a run callback and load the run it is keyed to.
///
/// Terminal runs have no stored hash any more; a well-formed callback token
/// still gets the run back so the handler can answer idempotently without
/// mutating.
pub fn callback_run(
    store: &dyn Store,
    headers: &HeaderMap,
    run_id: Uuid,
) -> Result<ModuleRun, ApiError> {
    let token = bearer(headers)?;
    if butler_token::classify(token) == TokenKind::Registry {
        // Registry tokens are rejected here before any lookup.
        return Err(ApiError(RegistryError::Unauthorized(
            "registry tokens are not valid for callback endpoints".to_string(),
        )));
    }
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| ApiError(RegistryError::NotFound(format!("run {run_id}"))))?;
    match &run.callback_token_hash {
        Some(stored) if butler_token::verify_token(token, stored) => Ok(run),
        Some(_) => Err(ApiError(RegistryError::Unauthorized(
            "token does not match this run".to_string(),
        ))),
        None if run.status.is_terminal() => Ok(run),
        None => Err(ApiError(RegistryError::Unauthorized(
            "run has no active callback token".to_string(),
        ))),
    }
}

/// Best-effort client key for webhook rate limiting: the first
/// `X-Forwarded-For` hop when present, else the socket address.
pub fn client_key(headers: &HeaderMap, remote: std::net::SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| remote.ip().to_string())
}
