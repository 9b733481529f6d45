//! Expiring in-memory cache for expensive warehouse reads.
//!
//! Keys are opaque strings; values are JSON documents shared behind `Arc` so
//! readers never observe a torn value. The cache is advisory only: a stale
//! hit may cost latency but never decides a write, because guardrails reread
//! the warehouse directly.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheEntry {
    value: Arc<serde_json::Value>,
    inserted_at: Instant,
}

/// Point-in-time counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ExpiringCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ExpiringCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetch a live entry. Expired entries count as a miss and are evicted.
    pub fn get(&self, key: &str) -> Option<Arc<serde_json::Value>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if now.duration_since(entry.inserted_at) <= self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(Arc::clone(&entry.value));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Entry exists but is expired; re-check under the write lock in case
        // a concurrent put refreshed it.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if now.duration_since(entry.inserted_at) <= self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.value));
            }
            entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        let mut entries = self.entries.write();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // Soft memory bound: drop the oldest entry.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %oldest, "cache overflow eviction");
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value: Arc::new(value),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Serialize-and-put convenience for typed payloads.
    pub fn put_typed<T: Serialize>(&self, key: impl Into<String>, value: &T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.put(key, json);
        }
    }

    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every entry whose key starts with `prefix`. Used after executions
    /// to flush a customer's dashboard reads.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let dropped = (before - entries.len()) as u64;
        if dropped > 0 {
            self.evictions.fetch_add(dropped, Ordering::Relaxed);
            debug!(prefix, dropped, "cache prefix invalidation");
        }
    }

    /// Sweep expired entries. Called from a background interval.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
        let dropped = before - entries.len();
        self.evictions.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hit_then_expiry_miss() {
        let cache = ExpiringCache::new(Duration::from_millis(20), 100);
        cache.put("k", json!({"v": 1}));
        assert!(cache.get("k").is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("k").is_none());
        // The expired entry was evicted on read.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let cache = ExpiringCache::new(Duration::from_secs(60), 2);
        cache.put("a", json!(1));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("b", json!(2));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("c", json!(3));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn prefix_invalidation_only_touches_prefix() {
        let cache = ExpiringCache::new(Duration::from_secs(60), 100);
        cache.put("cust:9999:windows", json!(1));
        cache.put("cust:9999:changes", json!(2));
        cache.put("cust:1234:windows", json!(3));

        cache.invalidate_prefix("cust:9999:");
        assert!(cache.get("cust:9999:windows").is_none());
        assert!(cache.get("cust:9999:changes").is_none());
        assert!(cache.get("cust:1234:windows").is_some());
    }

    #[test]
    fn purge_sweeps_expired_entries() {
        let cache = ExpiringCache::new(Duration::from_millis(10), 100);
        cache.put("a", json!(1));
        cache.put("b", json!(2));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = ExpiringCache::new(Duration::from_secs(60), 100);
        cache.put("k", json!(1));
        cache.get("k");
        cache.get("absent");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
