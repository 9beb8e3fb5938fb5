//! Short-TTL cache for rendered Helm repository indexes.
//!
//! The index for a namespace is invalidated whenever any helm-chart version
//! in that namespace changes status; the TTL is a safety net for missed
//! invalidations, not the primary freshness mechanism.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// A cached index document with its ETag.
#[derive(Debug, Clone)]
pub struct CachedIndex {
    pub content: String,
    pub etag: String,
}

#[derive(Debug)]
struct Entry {
    content: String,
    etag: String,
    created_at: Instant,
}

/// Per-process memoization of `namespace -> index.yaml`.
#[derive(Debug)]
pub struct HelmIndexCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl HelmIndexCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the cached index for a namespace, unless it has expired.
    pub fn get(&self, namespace: &str) -> Option<CachedIndex> {
        self.get_at(namespace, Instant::now())
    }

    /// Cache a rendered index and return its ETag.
    pub fn set(&self, namespace: &str, content: String) -> String {
        let etag = make_etag(&content);
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(
            namespace.to_string(),
            Entry {
                content,
                etag: etag.clone(),
                created_at: Instant::now(),
            },
        );
        etag
    }

    /// Drop the cached index for a namespace.
    pub fn invalidate(&self, namespace: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(namespace);
    }

    fn get_at(&self, namespace: &str, now: Instant) -> Option<CachedIndex> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = entries.get(namespace)?;
        if now.saturating_duration_since(entry.created_at) > self.ttl {
            return None;
        }
        Some(CachedIndex {
            content: entry.content.clone(),
            etag: entry.etag.clone(),
        })
    }
}

/// Quoted ETag: first 16 hex characters of the content's SHA-256.
fn make_etag(content: &str) -> String {
    let digest = hex::encode(Sha256::digest(content.as_bytes()));
    format!("\"{}\"", &digest[..16])
}
