//! Multi-level result cache with TTL and pluggable eviction
//!
//! This module provides:
//! - A size-bounded key/value store over `serde_json` values
//! - Per-entry TTL with lazy delete-on-read and a periodic sweep
//! - Four replacement policies (LRU, LFU, FIFO, adaptive)
//! - Hit/miss/eviction statistics for monitoring
//!
//! The store is best-effort from the dispatcher's point of view: a cache
//! failure is logged and never surfaced to the caller.

mod policy;

pub use policy::ReplacementPolicy;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Logical cache tier an entry belongs to.
///
/// Tiers are metadata labels on entries (session-scoped results vs.
/// long-lived lexicon lookups); all tiers share one in-process store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    #[default]
    Memory,
    Session,
    Persistent,
}

/// A single cached value with bookkeeping metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    level: CacheLevel,
    expires_at: Option<Instant>,
    last_accessed: Instant,
    access_count: u64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size_bytes: usize,
    pub entry_count: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, in `[0, 1]`
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of lookups that missed, in `[0, 1]`
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order, for FIFO eviction
    insertion_order: VecDeque<String>,
    size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        self.insertion_order.retain(|k| k != key);
        Some(entry)
    }
}

/// Capability interface the dispatcher and maintenance loop depend on.
///
/// [`CacheStore`] is the in-process implementation; a session-scoped or
/// persistent store can be swapped in without touching the dispatcher.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: String, value: Value, ttl: Option<Duration>, level: CacheLevel)
    -> Result<()>;
    fn delete(&self, key: &str) -> bool;
    fn has(&self, key: &str) -> bool;
    fn clear(&self);
    fn stats(&self) -> CacheStats;
    /// Remove expired entries; returns how many were removed
    fn sweep(&self) -> usize;
}

/// Shared cache handle used across the dispatcher
pub type SharedCache = std::sync::Arc<dyn Cache>;

/// Size-bounded key/value cache shared by all dispatch routes
pub struct CacheStore {
    inner: Mutex<CacheInner>,
    max_size_bytes: usize,
    policy: ReplacementPolicy,
}

impl CacheStore {
    /// Create a cache with the given byte budget and replacement policy
    pub fn new(max_size_bytes: usize, policy: ReplacementPolicy) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size_bytes,
            policy,
        }
    }

    /// Create a cache from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size_bytes, config.policy)
    }

    /// Look up a value, updating recency and hit/miss counters.
    ///
    /// An expired entry is removed on read and counts as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().ok()?;
        let now = Instant::now();

        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.remove_entry(key);
            inner.misses += 1;
            return None;
        }

        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = now;
                entry.access_count += 1;
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a value, evicting per policy if the byte budget would overflow
    pub fn set(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
        level: CacheLevel,
    ) -> Result<()> {
        let key = key.into();
        let size_bytes = estimate_size(&value);

        if size_bytes > self.max_size_bytes {
            return Err(Error::Cache(format!(
                "Entry '{}' ({} bytes) exceeds cache capacity ({} bytes)",
                key, size_bytes, self.max_size_bytes
            )));
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Cache("Cache lock poisoned".into()))?;

        // Replacement: drop the old entry before accounting the new one
        inner.remove_entry(&key);

        if inner.size_bytes + size_bytes > self.max_size_bytes {
            self.evict_for(&mut inner, size_bytes);
        }

        if inner.size_bytes + size_bytes > self.max_size_bytes {
            return Err(Error::Cache(format!(
                "Insufficient space for '{}' after bounded eviction",
                key
            )));
        }

        let now = Instant::now();
        let entry = CacheEntry {
            value,
            level,
            expires_at: ttl.map(|d| now + d),
            last_accessed: now,
            access_count: 0,
            size_bytes,
        };

        inner.size_bytes += size_bytes;
        inner.entries.insert(key.clone(), entry);
        inner.insertion_order.push_back(key);
        Ok(())
    }

    /// Remove a key; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.inner
            .lock()
            .ok()
            .and_then(|mut inner| inner.remove_entry(key))
            .is_some()
    }

    /// Tier the live entry was stored under
    pub fn level_of(&self, key: &str) -> Option<CacheLevel> {
        let inner = self.inner.lock().ok()?;
        let entry = inner.entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.level)
    }

    /// Whether a live (non-expired) entry exists; does not touch counters
    pub fn has(&self, key: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let now = Instant::now();
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.remove_entry(key);
            return false;
        }
        inner.entries.contains_key(key)
    }

    /// Drop all entries, keeping hit/miss history
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.insertion_order.clear();
            inner.size_bytes = 0;
        }
    }

    /// Snapshot of current statistics
    pub fn stats(&self) -> CacheStats {
        match self.inner.lock() {
            Ok(inner) => CacheStats {
                hits: inner.hits,
                misses: inner.misses,
                evictions: inner.evictions,
                size_bytes: inner.size_bytes,
                entry_count: inner.entries.len(),
            },
            Err(_) => CacheStats::default(),
        }
    }

    /// Remove all expired entries; returns how many were removed.
    ///
    /// Called by the maintenance loop on its sweep tick.
    pub fn sweep(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove_entry(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Cache sweep removed expired entries");
        }
        expired.len()
    }

    /// Evict entries per policy until `needed` bytes fit or the per-insert
    /// cap (25% of current entries) is reached.
    fn evict_for(&self, inner: &mut CacheInner, needed: usize) {
        let entry_count = inner.entries.len();
        if entry_count == 0 {
            return;
        }
        let max_evictions = (entry_count.div_ceil(4)).max(1);
        let now = Instant::now();

        let victims: Vec<String> = match self.policy {
            ReplacementPolicy::Fifo => inner
                .insertion_order
                .iter()
                .take(max_evictions)
                .cloned()
                .collect(),
            policy => {
                let mut scored: Vec<(String, f64)> = inner
                    .entries
                    .iter()
                    .map(|(k, e)| (k.clone(), policy.score(e.last_accessed, e.access_count, now)))
                    .collect();
                scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                scored
                    .into_iter()
                    .take(max_evictions)
                    .map(|(k, _)| k)
                    .collect()
            }
        };

        let mut evicted = 0u64;
        for key in victims {
            if inner.size_bytes + needed <= self.max_size_bytes {
                break;
            }
            if inner.remove_entry(&key).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            inner.evictions += evicted;
            warn!(
                evicted,
                policy = %self.policy,
                "Cache evicted entries to make room"
            );
        }
    }
}

impl Cache for CacheStore {
    fn get(&self, key: &str) -> Option<Value> {
        CacheStore::get(self, key)
    }

    fn set(
        &self,
        key: String,
        value: Value,
        ttl: Option<Duration>,
        level: CacheLevel,
    ) -> Result<()> {
        CacheStore::set(self, key, value, ttl, level)
    }

    fn delete(&self, key: &str) -> bool {
        CacheStore::delete(self, key)
    }

    fn has(&self, key: &str) -> bool {
        CacheStore::has(self, key)
    }

    fn clear(&self) {
        CacheStore::clear(self)
    }

    fn stats(&self) -> CacheStats {
        CacheStore::stats(self)
    }

    fn sweep(&self) -> usize {
        CacheStore::sweep(self)
    }
}

/// Estimate the in-memory footprint of a JSON value.
///
/// Scalars count as 8 bytes, strings as 2 bytes per character plus 8
/// overhead, composites as the recursive sum plus 8 for the container.
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.chars().count() * 2 + 8,
        Value::Array(items) => 8 + items.iter().map(estimate_size).sum::<usize>(),
        Value::Object(map) => {
            8 + map
                .iter()
                .map(|(k, v)| k.chars().count() * 2 + 8 + estimate_size(v))
                .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_round_trip_counts_hit() {
        let cache = CacheStore::new(4096, ReplacementPolicy::Lru);
        cache
            .set("k", json!({"sign": "HELLO"}), None, CacheLevel::Memory)
            .unwrap();

        assert_eq!(cache.get("k"), Some(json!({"sign": "HELLO"})));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_miss_increments_counter() {
        let cache = CacheStore::new(4096, ReplacementPolicy::Lru);
        assert_eq!(cache.get("absent"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert!((stats.miss_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ttl_expiry_removes_entry() {
        let cache = CacheStore::new(4096, ReplacementPolicy::Lru);
        cache
            .set(
                "k",
                json!("v"),
                Some(Duration::from_millis(100)),
                CacheLevel::Memory,
            )
            .unwrap();
        assert!(cache.has("k"));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let cache = CacheStore::new(4096, ReplacementPolicy::Lru);
        cache
            .set("short", json!(1), Some(Duration::from_millis(50)), CacheLevel::Memory)
            .unwrap();
        cache.set("long", json!(2), None, CacheLevel::Memory).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.has("long"));
        assert!(!cache.has("short"));
    }

    #[test]
    fn test_lru_evicts_oldest_access() {
        // Each string value is 2*1 + 8 = 10 bytes; budget fits three.
        let cache = CacheStore::new(30, ReplacementPolicy::Lru);
        cache.set("a", json!("x"), None, CacheLevel::Memory).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.set("b", json!("x"), None, CacheLevel::Memory).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.set("c", json!("x"), None, CacheLevel::Memory).unwrap();

        // Touch "a" so "b" becomes the least recently used
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a").is_some());

        cache.set("d", json!("x"), None, CacheLevel::Memory).unwrap();
        assert!(cache.has("a"), "recently touched entry must survive");
        assert!(!cache.has("b"), "least recently used entry must be evicted");
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_fifo_evicts_insertion_order() {
        let cache = CacheStore::new(30, ReplacementPolicy::Fifo);
        cache.set("first", json!("x"), None, CacheLevel::Memory).unwrap();
        cache.set("second", json!("x"), None, CacheLevel::Memory).unwrap();
        cache.set("third", json!("x"), None, CacheLevel::Memory).unwrap();

        // Touching "first" must not save it under FIFO
        assert!(cache.get("first").is_some());
        cache.set("fourth", json!("x"), None, CacheLevel::Memory).unwrap();
        assert!(!cache.has("first"));
        assert!(cache.has("second"));
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = CacheStore::new(16, ReplacementPolicy::Lru);
        let result = cache.set("big", json!("0123456789abcdef"), None, CacheLevel::Memory);
        assert!(matches!(result, Err(Error::Cache(_))));
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[test]
    fn test_eviction_capped_at_quarter_of_entries() {
        // 20 entries of 10 bytes; inserting a 60-byte value would need 6
        // evictions but the cap allows only 5 (25% of 20).
        let cache = CacheStore::new(200, ReplacementPolicy::Lru);
        for i in 0..20 {
            cache
                .set(format!("k{}", i), json!("x"), None, CacheLevel::Memory)
                .unwrap();
        }
        let result = cache.set(
            "wide",
            json!("0123456789012345678901234"), // 25 chars -> 58 bytes
            None,
            CacheLevel::Memory,
        );
        assert!(result.is_err(), "bounded eviction must not free enough space");
        let stats = cache.stats();
        assert_eq!(stats.evictions, 5);
        assert_eq!(stats.entry_count, 15);
    }

    #[test]
    fn test_size_estimation() {
        assert_eq!(estimate_size(&json!(null)), 8);
        assert_eq!(estimate_size(&json!(true)), 8);
        assert_eq!(estimate_size(&json!(42)), 8);
        assert_eq!(estimate_size(&json!("abc")), 14);
        assert_eq!(estimate_size(&json!([1, 2])), 24);
        // {"a": 1} -> 8 (object) + 2 + 8 (key) + 8 (value)
        assert_eq!(estimate_size(&json!({"a": 1})), 26);
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = CacheStore::new(4096, ReplacementPolicy::Lru);
        cache.set("k", json!(1), None, CacheLevel::Session).unwrap();
        assert_eq!(cache.level_of("k"), Some(CacheLevel::Session));
        assert!(cache.get("k").is_some());
        cache.clear();
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_delete() {
        let cache = CacheStore::new(4096, ReplacementPolicy::Lru);
        cache.set("k", json!(1), None, CacheLevel::Memory).unwrap();
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
    }
}
