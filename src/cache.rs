//! Short-lived response cache for list and dashboard endpoints.
//!
//! Keys are blake3 digests over the namespace, the caller's scope and the canonical JSON
//! of the request parameters. Writes invalidate a whole namespace by bumping its
//! generation; stale entries are then treated as misses and evicted lazily.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;

use crate::error::AppResult;
use crate::metrics::Metrics;

pub const NS_STUDENTS: &str = "students";
pub const NS_APPLICATIONS: &str = "applications";
pub const NS_DASHBOARD: &str = "dashboard";
pub const NS_SEGMENTS: &str = "segments";

struct Entry {
    namespace: String,
    generation: u64,
    expires_at: Instant,
    value: Value,
}

struct Inner {
    entries: LruCache<String, Entry>,
    generations: HashMap<String, u64>,
}

#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
    metrics: Metrics,
}

/// Digest identifying one cached response.
pub fn cache_key(namespace: &str, scope: &str, params: &impl Serialize) -> AppResult<String> {
    // serde_json maps are sorted, so equal parameters serialise identically
    let canonical = serde_json::to_vec(&serde_json::to_value(params)?)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(namespace.as_bytes());
    hasher.update(&[0]);
    hasher.update(scope.as_bytes());
    hasher.update(&[0]);
    hasher.update(&canonical);
    Ok(hasher.finalize().to_hex().to_string())
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration, metrics: Metrics) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner { entries: LruCache::new(capacity), generations: HashMap::new() })),
            ttl,
            metrics,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let fresh = match inner.entries.peek(key) {
            Some(entry) => {
                let current = inner.generations.get(&entry.namespace).copied().unwrap_or(0);
                entry.generation == current && entry.expires_at > now
            }
            None => {
                self.metrics.inc_cache_misses();
                return None;
            }
        };
        if !fresh {
            inner.entries.pop(key);
            self.metrics.inc_cache_misses();
            return None;
        }
        self.metrics.inc_cache_hits();
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Current generation of `namespace`. Read it before querying and hand it to
    /// [`insert`](Self::insert) so a write that lands in between is not masked.
    pub fn generation(&self, namespace: &str) -> u64 {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.generations.get(namespace).copied().unwrap_or(0)
    }

    /// Stores `value` unless `namespace` was invalidated since `generation` was read.
    pub fn insert(&self, namespace: &str, generation: u64, key: String, value: Value) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = inner.generations.get(namespace).copied().unwrap_or(0);
        if generation != current {
            tracing::debug!(namespace, "skipping cache insert computed before invalidation");
            return;
        }
        inner.entries.put(
            key,
            Entry { namespace: namespace.to_string(), generation, expires_at: Instant::now() + self.ttl, value },
        );
    }

    /// Drops every entry of the given namespaces.
    pub fn invalidate(&self, namespaces: &[&str]) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for ns in namespaces {
            *inner.generations.entry(ns.to_string()).or_insert(0) += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
