use crate::hotcache::fnv1a;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Clone)]
pub struct MemObject {
    pub data: Bytes,
    pub content_type: String,
    pub modified: DateTime<Utc>,
}

/// Sharded keyed-byte store that stands in for the filesystem when the
/// engine-wide in-memory mode is enabled. Keys are `bucket/key`.
pub struct MemStore {
    shards: Vec<RwLock<HashMap<String, MemObject>>>,
    mask: usize,
}

impl MemStore {
    pub fn new(shard_count: usize) -> Self {
        let n = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
            mask: n - 1,
        }
    }

    pub fn put(&self, bucket: &str, key: &str, data: Bytes, content_type: String) {
        let full = format!("{bucket}/{key}");
        let object = MemObject {
            data,
            content_type,
            modified: Utc::now(),
        };
        self.shards[self.shard_for(&full)].write().insert(full, object);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<MemObject> {
        let full = format!("{bucket}/{key}");
        self.shards[self.shard_for(&full)].read().get(&full).cloned()
    }

    pub fn remove(&self, bucket: &str, key: &str) -> bool {
        let full = format!("{bucket}/{key}");
        self.shards[self.shard_for(&full)]
            .write()
            .remove(&full)
            .is_some()
    }

    pub fn remove_prefix(&self, bucket: &str, prefix: &str) -> usize {
        let full = format!("{bucket}/{prefix}");
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.write();
            let before = map.len();
            map.retain(|k, _| !k.starts_with(&full));
            removed += before - map.len();
        }
        removed
    }

    /// All keys in `bucket` beginning with `prefix`, unsorted.
    pub fn entries(&self, bucket: &str, prefix: &str) -> Vec<(String, u64, DateTime<Utc>)> {
        let bucket_prefix = format!("{bucket}/");
        let mut out = Vec::new();
        for shard in &self.shards {
            let map = shard.read();
            for (k, v) in map.iter() {
                if let Some(key) = k.strip_prefix(&bucket_prefix) {
                    if key.starts_with(prefix) {
                        out.push((key.to_string(), v.data.len() as u64, v.modified));
                    }
                }
            }
        }
        out
    }

    fn shard_for(&self, full: &str) -> usize {
        (fnv1a(full.as_bytes()) as usize) & self.mask
    }
}
