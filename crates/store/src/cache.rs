//! Two-level LRU cache with TTLs and a hard memory ceiling.
//!
//! L1 is small and short-lived, L2 large and long-lived. A hit in L2 promotes
//! the entry back into L1. Entries larger than the single-item ceiling are
//! refused outright.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    pub l1_max_entries: usize,
    pub l1_ttl: Duration,
    pub l2_max_entries: usize,
    pub l2_ttl: Duration,
    pub max_memory_bytes: usize,
    pub max_item_bytes: usize,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: 256,
            l1_ttl: Duration::from_secs(60),
            l2_max_entries: 2048,
            l2_ttl: Duration::from_secs(900),
            max_memory_bytes: 128 * 1024 * 1024,
            max_item_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected_oversize: u64,
    pub memory_bytes: usize,
}

struct Entry {
    value: serde_json::Value,
    size: usize,
    expires_at: Instant,
}

struct Inner {
    l1: LruCache<String, Entry>,
    l2: LruCache<String, Entry>,
    memory_bytes: usize,
    stats: CacheStats,
}

pub struct TieredCache {
    config: TieredCacheConfig,
    inner: Mutex<Inner>,
}

impl TieredCache {
    pub fn new(config: TieredCacheConfig) -> Self {
        let l1_cap = NonZeroUsize::new(config.l1_max_entries).unwrap_or(NonZeroUsize::MIN);
        let l2_cap = NonZeroUsize::new(config.l2_max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                l1: LruCache::new(l1_cap),
                l2: LruCache::new(l2_cap),
                memory_bytes: 0,
                stats: CacheStats::default(),
            }),
            config,
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.l1.get(key) {
            if entry.expires_at > now {
                let value = entry.value.clone();
                inner.stats.l1_hits += 1;
                return Some(value);
            }
            let dropped = inner.l1.pop(key);
            Self::release(&mut inner, dropped);
        }

        // L2 hit promotes back into L1 with a fresh L1 TTL.
        if let Some(entry) = inner.l2.pop(key) {
            if entry.expires_at > now {
                let value = entry.value.clone();
                inner.stats.l2_hits += 1;
                let promoted = Entry {
                    value: entry.value,
                    size: entry.size,
                    expires_at: now + self.config.l1_ttl,
                };
                trace!(key, "cache promotion l2 -> l1");
                // The bytes are already counted; the re-insert below must
                // not count them twice.
                inner.memory_bytes = inner.memory_bytes.saturating_sub(promoted.size);
                Self::insert_level(&mut inner, key.to_string(), promoted, Level::L1);
                return Some(value);
            }
            Self::release(&mut inner, Some(entry));
        }

        inner.stats.misses += 1;
        None
    }

    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        let size = estimate_size(&value);
        let mut inner = self.inner.lock().unwrap();

        if size > self.config.max_item_bytes {
            inner.stats.rejected_oversize += 1;
            return;
        }

        // Replacing an existing entry must not double-count its bytes.
        let dropped = inner.l1.pop(&key);
        Self::release(&mut inner, dropped);
        let dropped = inner.l2.pop(&key);
        Self::release(&mut inner, dropped);

        let entry = Entry {
            value,
            size,
            expires_at: Instant::now() + self.config.l1_ttl,
        };
        Self::insert_level(&mut inner, key, entry, Level::L1);

        // Hard ceiling: evict LRU entries (L2 first, then L1) until under.
        while inner.memory_bytes > self.config.max_memory_bytes {
            let victim = if inner.l2.len() > 0 {
                inner.l2.pop_lru()
            } else {
                inner.l1.pop_lru()
            };
            match victim {
                Some((_, entry)) => {
                    inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.size);
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.l1.pop(key);
        Self::release(&mut inner, dropped);
        let dropped = inner.l2.pop(key);
        Self::release(&mut inner, dropped);
    }

    /// Drop every expired entry. Called by the periodic cleanup job.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;

        for level in [Level::L1, Level::L2] {
            let expired: Vec<String> = {
                let cache = match level {
                    Level::L1 => &inner.l1,
                    Level::L2 => &inner.l2,
                };
                cache
                    .iter()
                    .filter(|(_, e)| e.expires_at <= now)
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            for key in expired {
                let dropped = match level {
                    Level::L1 => inner.l1.pop(&key),
                    Level::L2 => inner.l2.pop(&key),
                };
                Self::release(&mut inner, dropped);
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            memory_bytes: inner.memory_bytes,
            ..inner.stats.clone()
        }
    }

    fn insert_level(inner: &mut Inner, key: String, entry: Entry, level: Level) {
        inner.memory_bytes += entry.size;
        let evicted = match level {
            Level::L1 => inner.l1.push(key, entry),
            Level::L2 => inner.l2.push(key, entry),
        };
        // An entry displaced from L1 demotes to L2 instead of vanishing.
        if let Some((old_key, old_entry)) = evicted {
            match level {
                Level::L1 => {
                    let demoted = inner.l2.push(old_key, old_entry);
                    if let Some((_, lost)) = demoted {
                        inner.memory_bytes = inner.memory_bytes.saturating_sub(lost.size);
                        inner.stats.evictions += 1;
                    }
                }
                Level::L2 => {
                    inner.memory_bytes = inner.memory_bytes.saturating_sub(old_entry.size);
                    inner.stats.evictions += 1;
                }
            }
        }
    }

    fn release(inner: &mut Inner, entry: Option<Entry>) {
        if let Some(entry) = entry {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.size);
        }
    }
}

#[derive(Clone, Copy)]
enum Level {
    L1,
    L2,
}

/// Rough byte size of a JSON value: its serialized length.
fn estimate_size(value: &serde_json::Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn small_config() -> TieredCacheConfig {
        TieredCacheConfig {
            l1_max_entries: 2,
            l1_ttl: Duration::from_secs(60),
            l2_max_entries: 4,
            l2_ttl: Duration::from_secs(600),
            max_memory_bytes: 1024 * 1024,
            max_item_bytes: 128,
        }
    }

    #[test]
    fn l1_eviction_demotes_to_l2_and_hit_promotes_back() {
        let cache = TieredCache::new(small_config());
        cache.put("a", json!(1));
        cache.put("b", json!(2));
        cache.put("c", json!(3)); // displaces "a" into L2

        assert_eq!(cache.get("a"), Some(json!(1)));
        let stats = cache.stats();
        assert_eq!(stats.l2_hits, 1);

        // "a" is hot again; hitting it now lands in L1.
        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.stats().l1_hits, 1);
    }

    #[test]
    fn oversize_items_are_refused() {
        let cache = TieredCache::new(small_config());
        let big = json!("x".repeat(4096));
        cache.put("big", big);

        assert_eq!(cache.get("big"), None);
        assert_eq!(cache.stats().rejected_oversize, 1);
    }

    #[test]
    fn memory_ceiling_evicts_lru() {
        let config = TieredCacheConfig {
            max_memory_bytes: 64,
            max_item_bytes: 64,
            ..small_config()
        };
        let cache = TieredCache::new(config);
        for i in 0..10 {
            cache.put(format!("k{i}"), json!("0123456789012345"));
        }
        assert!(cache.stats().memory_bytes <= 64);
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn replacing_a_key_does_not_leak_bytes() {
        let cache = TieredCache::new(small_config());
        cache.put("k", json!("0123456789"));
        let before = cache.stats().memory_bytes;
        cache.put("k", json!("0123456789"));
        assert_eq!(cache.stats().memory_bytes, before);
    }

    #[test]
    fn remove_clears_both_levels() {
        let cache = TieredCache::new(small_config());
        cache.put("a", json!(1));
        cache.remove("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().memory_bytes, 0);
    }
}
