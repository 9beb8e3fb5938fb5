//! Token-bucket rate limiting.
//!
//! One bucket per key; the key is a token id for protocol endpoints and a
//! source IP for webhooks, chosen per route. Buckets are per-process and
//! allowed to drift across replicas — limits are protective, not strict
//! accounting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::{RegistryError, Result};

/// Buckets idle for this long are evicted.
const IDLE_EVICTION: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

/// Token-bucket limiter keyed by caller identity.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens added per second.
    rate: f64,
    /// Bucket capacity.
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            rate: f64::from(config.requests_per_minute) / 60.0,
            burst: f64::from(config.burst_size.max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`, or fail with `RateLimited` carrying the
    /// `Retry-After` seconds.
    pub fn check(&self, key: &str) -> Result<()> {
        self.check_at(key, Instant::now())
    }

    /// Drop buckets untouched for five minutes.
    pub fn evict_idle(&self) {
        self.evict_idle_at(Instant::now());
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<()> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
            last_touched: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_touched = now;

        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / self.rate).ceil() as u64;
            return Err(RegistryError::RateLimited { retry_after_secs });
        }
        bucket.tokens -= 1.0;
        Ok(())
    }

    fn evict_idle_at(&self, now: Instant) {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buckets.retain(|_, b| now.saturating_duration_since(b.last_touched) < IDLE_EVICTION);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
