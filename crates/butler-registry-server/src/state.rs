//! Shared application state.

use std::sync::Arc;

use butler_registry::config::RegistryConfig;
use butler_registry::helm_cache::HelmIndexCache;
use butler_registry::ratelimit::RateLimiter;
use butler_registry::store::Store;

/// State handed to every handler. Cheap to clone; everything shared lives
/// behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<RegistryConfig>,
    /// Keyed by source IP (webhooks).
    pub webhook_limiter: Arc<RateLimiter>,
    /// Keyed by token id (registry API).
    pub api_limiter: Arc<RateLimiter>,
    pub helm_cache: Arc<HelmIndexCache>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: RegistryConfig) -> Self {
        let rate_limit = config.rate_limit;
        let helm_ttl = config.helm_index_cache.ttl;
        Self {
            store,
            config: Arc::new(config),
            webhook_limiter: Arc::new(RateLimiter::new(rate_limit)),
            api_limiter: Arc::new(RateLimiter::new(rate_limit)),
            helm_cache: Arc::new(HelmIndexCache::new(helm_ttl)),
        }
    }
}
