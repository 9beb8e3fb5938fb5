//! Configuration file support for Butler Registry (`butler.toml`).
//!
//! Every knob has a default so a bare config file (or none at all) yields a
//! working single-node registry. Durations accept human-readable strings
//! ("30s", "5m") or integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Top-level registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub webhooks: WebhooksConfig,
    pub dispatch: DispatchConfig,
    pub rate_limit: RateLimitConfig,
    pub helm_index_cache: HelmIndexCacheConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8380".to_string(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("butler-registry.db"),
        }
    }
}

/// Per-provider webhook secrets. A provider with no secret configured is
/// disabled: its deliveries never verify.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhooksConfig {
    /// GitHub HMAC secret (`X-Hub-Signature-256`).
    pub github_secret: Option<String>,
    /// GitLab shared token (`X-Gitlab-Token`).
    pub gitlab_token: Option<String>,
    /// Bitbucket HMAC secret (`X-Hub-Signature`).
    pub bitbucket_secret: Option<String>,
}

impl WebhooksConfig {
    /// Secret for the named provider, when that provider is enabled.
    pub fn secret_for(&self, provider: &str) -> Option<&str> {
        match provider {
            "github" => self.github_secret.as_deref(),
            "gitlab" => self.gitlab_token.as_deref(),
            "bitbucket" => self.bitbucket_secret.as_deref(),
            _ => None,
        }
    }
}

/// Dispatch target for PeaaS-mode runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeaasTarget {
    pub owner: String,
    pub repo: String,
}

/// Outbound run-dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Master switch for the dispatch loop.
    pub enabled: bool,
    /// Base URL executors call back to.
    pub butler_url: String,
    /// Repository receiving PeaaS-mode dispatch events.
    pub peaas: Option<PeaasTarget>,
    /// Credential for the outbound dispatch API.
    pub github_token: Option<String>,
    /// Base URL of the dispatch API (override for tests).
    pub api_base: String,
    /// Active-run cap across both execution modes.
    pub max_concurrent_runs: u32,
    /// Wall-clock budget per run, measured from creation.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    /// How long a planned run may await confirmation.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub confirmation_timeout: Duration,
    /// Queue poll cadence.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub poll_interval: Duration,
    /// Confirmation sweep cadence.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub sweep_interval: Duration,
    /// Outbound HTTP timeout for dispatch posts.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub http_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            butler_url: "http://localhost:8380".to_string(),
            peaas: None,
            github_token: None,
            api_base: "https://api.github.com".to_string(),
            max_concurrent_runs: 5,
            timeout: Duration::from_secs(3600),
            confirmation_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// Token-bucket rate limiting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

/// Helm repository index cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HelmIndexCacheConfig {
    /// Safety-net TTL for entries that missed an invalidation.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub ttl: Duration,
}

impl Default for HelmIndexCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
