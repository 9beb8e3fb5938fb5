//! Error taxonomy for the registry core.
//!
//! Components return these kinds; the HTTP layer maps them onto status
//! codes. Background loops never propagate — they log and continue.

use thiserror::Error;

use crate::types::{RuleResult, RunStatus};

/// All error kinds surfaced by the core.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("illegal run transition: {from:?} -> {to:?}")]
    IllegalTransition { from: RunStatus, to: RunStatus },

    #[error("policy check failed")]
    PolicyFail { results: Vec<RuleResult> },

    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream module {0} has no successful apply with outputs")]
    UpstreamNotReady(String),

    #[error("upstream output {key:?} not found; available outputs: {available:?}")]
    UpstreamOutputMissing {
        key: String,
        available: Vec<String>,
    },

    #[error("dependency cycle detected among environment modules")]
    DependencyCycle,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl RegistryError {
    /// HTTP status the adapter layer maps this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::IllegalTransition { .. } | Self::DependencyCycle => 409,
            Self::PolicyFail { .. }
            | Self::UpstreamNotReady(_)
            | Self::UpstreamOutputMissing { .. } => 422,
            Self::RateLimited { .. } => 429,
            Self::Transport(_) => 502,
            Self::Storage(_) | Self::Internal(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("column serialization: {err}"))
    }
}

/// Core result alias.
pub type Result<T> = std::result::Result<T, RegistryError>;
