//! Bounded LRU response cache keyed by request fingerprint, TTL-expiring.
//!
//! One instance exists per process; the first model to enable caching fixes
//! the global TTL and capacity (known limitation, surfaced via `stats`).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields excluded from fingerprinting so logically equivalent requests
/// collide: the streaming flag, webhook wiring, and client-side request ids.
const VOLATILE_FIELDS: [&str; 4] = ["stream", "webhook", "webhook_events_filter", "request_id"];

/// Stable fingerprint over (model id, normalised request body).
///
/// serde_json serialises object keys in sorted order, so two bodies that
/// differ only in key order or in volatile fields hash identically.
pub fn fingerprint(model_id: &str, body: &Value) -> String {
    let normalised = match body {
        Value::Object(map) => {
            let mut map = map.clone();
            for field in VOLATILE_FIELDS {
                map.remove(field);
            }
            Value::Object(map)
        }
        other => other.clone(),
    };
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalised.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    response: Value,
    inserted: Instant,
}

struct CacheInner {
    map: HashMap<String, CacheEntry>,
    /// Recency order, least-recently-used at the front.
    order: VecDeque<String>,
    ttl: Duration,
    capacity: usize,
    configured: bool,
    hits: u64,
    misses: u64,
}

/// Cache statistics snapshot for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
    pub ttl_secs: u64,
}

/// Process-wide response cache with strict LRU eviction and lazy TTL expiry.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    /// An unconfigured cache; `ensure_configured` fixes TTL and capacity on
    /// first use.
    pub fn new() -> Self {
        ResponseCache {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                ttl: Duration::from_secs(300),
                capacity: 1000,
                configured: false,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Fix TTL and capacity if no model has configured the cache yet.
    /// Later calls are no-ops; the first enabling model wins.
    pub fn ensure_configured(&self, ttl: Duration, capacity: usize) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if !inner.configured {
            inner.ttl = ttl;
            inner.capacity = capacity;
            inner.configured = true;
        }
    }

    /// Look up a fingerprint. Entries past TTL count as misses and are
    /// removed.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let fresh = match inner.map.get(key) {
            Some(entry) => entry.inserted.elapsed() < inner.ttl,
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if !fresh {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            inner.misses += 1;
            return None;
        }
        inner.hits += 1;
        // Promote to most-recently-used.
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.to_string());
        inner.map.get(key).map(|e| e.response.clone())
    }

    /// Insert a response, evicting least-recently-used entries on overflow.
    pub fn put(&self, key: String, response: Value) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.map.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else {
            while inner.map.len() >= inner.capacity {
                match inner.order.pop_front() {
                    Some(lru) => {
                        inner.map.remove(&lru);
                    }
                    None => break,
                }
            }
        }
        inner.order.push_back(key.clone());
        inner.map.insert(
            key,
            CacheEntry {
                response,
                inserted: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.map.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let total = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.map.len(),
            max_size: inner.capacity,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
            ttl_secs: inner.ttl.as_secs(),
        }
    }
}
