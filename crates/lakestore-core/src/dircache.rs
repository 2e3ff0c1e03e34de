use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Sharded cache of recently-verified directories. A hit within the TTL
/// skips the `create_dir_all` round-trip on the hot write path.
pub struct DirCache {
    shards: Vec<RwLock<HashMap<PathBuf, Instant>>>,
    mask: usize,
    ttl: Duration,
    per_shard_cap: usize,
}

impl DirCache {
    pub fn new(shard_count: usize, ttl: Duration, max_entries: usize) -> Self {
        let n = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
            mask: n - 1,
            ttl,
            per_shard_cap: (max_entries / n).max(1),
        }
    }

    /// Guarantee `path` exists as a directory. After a successful return the
    /// directory exists on the filesystem.
    pub async fn ensure_dir(&self, path: &Path) -> io::Result<()> {
        let shard = &self.shards[self.shard_for(path)];
        {
            let map = shard.read();
            if let Some(verified) = map.get(path) {
                if verified.elapsed() < self.ttl {
                    return Ok(());
                }
            }
        }

        create_dir_tree(path).await?;

        let mut map = shard.write();
        if map.len() >= self.per_shard_cap {
            evict_older_half(&mut map);
        }
        map.insert(path.to_path_buf(), Instant::now());
        Ok(())
    }

    fn shard_for(&self, path: &Path) -> usize {
        (crate::hotcache::fnv1a(path.as_os_str().as_encoded_bytes()) as usize) & self.mask
    }
}

#[cfg(unix)]
async fn create_dir_tree(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o750);
        builder.create(&path)
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(not(unix))]
async fn create_dir_tree(path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

/// Keep the newest half of the shard.
fn evict_older_half(map: &mut HashMap<PathBuf, Instant>) {
    let mut stamps: Vec<Instant> = map.values().copied().collect();
    stamps.sort_unstable();
    let cutoff = stamps[stamps.len() / 2];
    map.retain(|_, verified| *verified >= cutoff);
}
