use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Payloads above this size are never cached.
pub const CACHEABLE_MAX: usize = 128 * 1024;

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

struct CacheEntry {
    data: Bytes,
    modified: DateTime<Utc>,
}

struct CacheShard {
    lru: LruCache<String, CacheEntry>,
    bytes: usize,
}

/// Sharded LRU cache of small object payloads, keyed `bucket/key`. Inserts
/// store an independent copy of the payload; lookups hand out copies (or a
/// shared `Bytes` on the zero-copy variant) so callers can never alias the
/// cache's memory mutably.
pub struct ObjectCache {
    shards: Vec<RwLock<CacheShard>>,
    mask: usize,
    max_bytes_per_shard: usize,
    max_items_per_shard: usize,
    stats: CacheStats,
}

impl ObjectCache {
    pub fn new(shard_count: usize, max_bytes: usize, max_items: usize) -> Self {
        let n = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..n)
                .map(|_| {
                    RwLock::new(CacheShard {
                        lru: LruCache::unbounded(),
                        bytes: 0,
                    })
                })
                .collect(),
            mask: n - 1,
            max_bytes_per_shard: (max_bytes / n).max(CACHEABLE_MAX),
            max_items_per_shard: (max_items / n).max(1),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Insert a payload copy. Oversized payloads are silently dropped.
    pub fn put(&self, bucket: &str, key: &str, data: &[u8], modified: DateTime<Utc>) {
        if data.len() > CACHEABLE_MAX {
            return;
        }
        let cache_key = compose_key(bucket, key);
        let mut shard = self.shards[self.shard_for(&cache_key)].write();
        let entry = CacheEntry {
            data: Bytes::copy_from_slice(data),
            modified,
        };
        shard.bytes += data.len();
        if let Some((_, old)) = shard.lru.push(cache_key, entry) {
            shard.bytes -= old.data.len();
        }
        while shard.bytes > self.max_bytes_per_shard
            || shard.lru.len() > self.max_items_per_shard
        {
            match shard.lru.pop_lru() {
                Some((_, evicted)) => {
                    shard.bytes -= evicted.data.len();
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Owned-copy lookup. The hit also refreshes recency.
    pub fn get(&self, bucket: &str, key: &str) -> Option<(Vec<u8>, DateTime<Utc>)> {
        self.get_shared(bucket, key)
            .map(|(data, modified)| (data.to_vec(), modified))
    }

    /// Zero-copy lookup returning a shared read-only payload.
    pub fn get_shared(&self, bucket: &str, key: &str) -> Option<(Bytes, DateTime<Utc>)> {
        let cache_key = compose_key(bucket, key);
        let mut shard = self.shards[self.shard_for(&cache_key)].write();
        match shard.lru.get(&cache_key) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.data.clone(), entry.modified))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn invalidate(&self, bucket: &str, key: &str) {
        let cache_key = compose_key(bucket, key);
        let mut shard = self.shards[self.shard_for(&cache_key)].write();
        if let Some(entry) = shard.lru.pop(&cache_key) {
            shard.bytes -= entry.data.len();
        }
    }

    /// Remove every entry whose key starts with `bucket/prefix`.
    pub fn invalidate_prefix(&self, bucket: &str, prefix: &str) {
        let cache_prefix = compose_key(bucket, prefix);
        for shard in &self.shards {
            let mut shard = shard.write();
            let doomed: Vec<String> = shard
                .lru
                .iter()
                .filter(|(k, _)| k.starts_with(&cache_prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(entry) = shard.lru.pop(&key) {
                    shard.bytes -= entry.data.len();
                }
            }
        }
    }

    fn shard_for(&self, cache_key: &str) -> usize {
        (fnv1a(cache_key.as_bytes()) as usize) & self.mask
    }
}

fn compose_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

/// FNV-1a over raw bytes; shard selection only.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ObjectCache {
        ObjectCache::new(4, 1024 * 1024, 1000)
    }

    #[test]
    fn test_put_get_round_trip() {
        let cache = cache();
        let now = Utc::now();
        cache.put("b", "k", b"payload", now);
        let (data, modified) = cache.get("b", "k").unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(modified, now);
    }

    #[test]
    fn test_get_returns_independent_copy() {
        let cache = cache();
        let mut source = b"mutable".to_vec();
        cache.put("b", "k", &source, Utc::now());
        source[0] = b'X';
        let (data, _) = cache.get("b", "k").unwrap();
        assert_eq!(data, b"mutable");
    }

    #[test]
    fn test_oversized_payload_dropped() {
        let cache = cache();
        let big = vec![0u8; CACHEABLE_MAX + 1];
        cache.put("b", "big", &big, Utc::now());
        assert!(cache.get("b", "big").is_none());
    }

    #[test]
    fn test_at_threshold_is_cached() {
        let cache = cache();
        let exact = vec![7u8; CACHEABLE_MAX];
        cache.put("b", "exact", &exact, Utc::now());
        assert!(cache.get("b", "exact").is_some());
    }

    #[test]
    fn test_replace_same_key() {
        let cache = cache();
        cache.put("b", "k", b"old", Utc::now());
        cache.put("b", "k", b"newer", Utc::now());
        let (data, _) = cache.get("b", "k").unwrap();
        assert_eq!(data, b"newer");
    }

    #[test]
    fn test_stats_counters() {
        let cache = cache();
        cache.put("b", "k", b"v", Utc::now());
        cache.get("b", "k");
        cache.get("b", "absent");
        let stats = cache.stats().snapshot();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_by_item_budget() {
        let cache = ObjectCache::new(1, 1024 * 1024, 2);
        cache.put("b", "a", b"1", Utc::now());
        cache.put("b", "b", b"2", Utc::now());
        // Refresh "a" so "b" is the LRU victim.
        cache.get("b", "a");
        cache.put("b", "c", b"3", Utc::now());
        assert!(cache.get("b", "a").is_some());
        assert!(cache.get("b", "b").is_none());
        assert!(cache.get("b", "c").is_some());
        assert_eq!(cache.stats().snapshot().evictions, 1);
    }

    #[test]
    fn test_eviction_by_byte_budget() {
        let cache = ObjectCache::new(1, CACHEABLE_MAX, 1000);
        let chunk = vec![1u8; 100 * 1024];
        cache.put("b", "a", &chunk, Utc::now());
        cache.put("b", "b", &chunk, Utc::now());
        // Both cannot fit inside one CACHEABLE_MAX shard budget.
        assert!(cache.get("b", "a").is_none());
        assert!(cache.get("b", "b").is_some());
    }

    #[test]
    fn test_invalidate() {
        let cache = cache();
        cache.put("b", "k", b"v", Utc::now());
        cache.invalidate("b", "k");
        assert!(cache.get("b", "k").is_none());
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = cache();
        cache.put("b", "dir/a", b"1", Utc::now());
        cache.put("b", "dir/b", b"2", Utc::now());
        cache.put("b", "other", b"3", Utc::now());
        cache.invalidate_prefix("b", "dir/");
        assert!(cache.get("b", "dir/a").is_none());
        assert!(cache.get("b", "dir/b").is_none());
        assert!(cache.get("b", "other").is_some());
    }

    #[test]
    fn test_buckets_do_not_collide() {
        let cache = cache();
        cache.put("b1", "k", b"one", Utc::now());
        cache.put("b2", "k", b"two", Utc::now());
        assert_eq!(cache.get("b1", "k").unwrap().0, b"one");
        assert_eq!(cache.get("b2", "k").unwrap().0, b"two");
    }

    #[test]
    fn test_fnv1a_known_vector() {
        // FNV-1a of empty input is the offset basis.
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(fnv1a(b"a"), fnv1a(b"b"));
    }
}
