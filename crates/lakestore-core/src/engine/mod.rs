mod list;
mod object;
mod read;
mod write;

pub use object::*;
#[cfg(unix)]
pub use read::MmapReader;
pub use read::{CachedReader, FileReader, ObjectReader};

use crate::config::{EngineConfig, parse_dsn};
use crate::dircache::DirCache;
use crate::error::StoreError;
use crate::hotcache::{CacheStatsSnapshot, ObjectCache};
use crate::memstore::MemStore;
use crate::path::{clean_key, join_under_root, sanitize_bucket_name};
use crate::platform::{PlatformIo, default_platform};
use crate::pool::BufferPools;
use crate::resumable::ResumableState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Shared engine context: pools, caches, platform adapter, and the
/// process-wide toggles. Constructed once per `Store`; no hidden globals.
pub(crate) struct Engine {
    pub(crate) root: PathBuf,
    pub(crate) config: EngineConfig,
    pub(crate) pools: Arc<BufferPools>,
    pub(crate) dirs: DirCache,
    pub(crate) cache: ObjectCache,
    pub(crate) mem: MemStore,
    pub(crate) platform: Arc<dyn PlatformIo>,
    pub(crate) resumable: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<ResumableState>>>>,
    durability_relaxed: AtomicBool,
    in_memory: AtomicBool,
    cache_enabled: AtomicBool,
}

impl Engine {
    pub(crate) fn fsync_enabled(&self) -> bool {
        !self.durability_relaxed.load(Ordering::Relaxed)
    }

    pub(crate) fn in_memory(&self) -> bool {
        self.in_memory.load(Ordering::Relaxed)
    }

    pub(crate) fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Relaxed)
    }
}

/// Root handle over a local directory tree. All filesystem access is
/// confined to the root's subtree.
#[derive(Clone)]
pub struct Store {
    pub(crate) engine: Arc<Engine>,
}

impl Store {
    pub fn open(dsn: &str) -> Result<Self, StoreError> {
        Self::with_config(dsn, EngineConfig::default())
    }

    pub fn with_config(dsn: &str, config: EngineConfig) -> Result<Self, StoreError> {
        let root = parse_dsn(dsn)?;
        let meta = std::fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(StoreError::InvalidInput(format!(
                "storage root {} is not a directory",
                root.display()
            )));
        }
        let root = root.canonicalize()?;

        let shards = if config.shard_count > 0 {
            config.shard_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
        .next_power_of_two();

        let engine = Engine {
            pools: Arc::new(BufferPools::new(shards)),
            dirs: DirCache::new(shards, config.dir_cache_ttl, config.dir_cache_max_entries),
            cache: ObjectCache::new(shards, config.cache_max_bytes, config.cache_max_items),
            mem: MemStore::new(shards),
            platform: default_platform(),
            resumable: Mutex::new(HashMap::new()),
            durability_relaxed: AtomicBool::new(config.durability_relaxed),
            in_memory: AtomicBool::new(config.in_memory),
            cache_enabled: AtomicBool::new(config.cache_enabled),
            root: root.clone(),
            config,
        };
        tracing::info!(root = %root.display(), platform = engine.platform.name(), "opened store");
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn root(&self) -> &Path {
        &self.engine.root
    }

    /// Trade durability for throughput by eliding fsync on every write path.
    pub fn set_durability_relaxed(&self, relaxed: bool) {
        self.engine
            .durability_relaxed
            .store(relaxed, Ordering::Relaxed);
    }

    /// Route all operations through the in-memory backend.
    pub fn set_in_memory(&self, enabled: bool) {
        self.engine.in_memory.store(enabled, Ordering::Relaxed);
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.engine.cache_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.engine.cache.stats().snapshot()
    }

    /// Capabilities of the local backend, as reported to adapters.
    pub fn features(&self) -> HashMap<&'static str, bool> {
        HashMap::from([
            ("move", true),
            ("directories", true),
            ("object_move_server", true),
            ("dir_move_server", true),
            ("multipart", true),
            ("signed_urls", false),
            ("copy_part", false),
        ])
    }

    pub fn bucket(&self, name: &str) -> Bucket {
        let name = sanitize_bucket_name(name);
        let root = self.engine.root.join(&name);
        Bucket {
            engine: Arc::clone(&self.engine),
            name,
            root,
        }
    }

    /// Create a bucket directory. Exclusive: an existing bucket is an error.
    pub async fn create_bucket(
        &self,
        cx: &CancellationToken,
        name: &str,
    ) -> Result<Bucket, StoreError> {
        check_cancelled(cx)?;
        let bucket = self.bucket(name);
        let path = bucket.root.clone();
        create_bucket_dir(path).await?;
        Ok(bucket)
    }

    /// Delete a bucket directory. Rejects non-empty buckets unless `force`.
    pub async fn delete_bucket(
        &self,
        cx: &CancellationToken,
        name: &str,
        force: bool,
    ) -> Result<(), StoreError> {
        check_cancelled(cx)?;
        let bucket = self.bucket(name);
        let mut entries = tokio::fs::read_dir(&bucket.root).await?;
        if !force && entries.next_entry().await?.is_some() {
            return Err(StoreError::PermissionDenied);
        }
        drop(entries);
        tokio::fs::remove_dir_all(&bucket.root).await?;
        self.engine.cache.invalidate_prefix(&bucket.name, "");
        Ok(())
    }

    pub async fn list_buckets(&self, cx: &CancellationToken) -> Result<Vec<String>, StoreError> {
        check_cancelled(cx)?;
        let mut entries = tokio::fs::read_dir(&self.engine.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Handle over one bucket's subtree.
#[derive(Clone)]
pub struct Bucket {
    pub(crate) engine: Arc<Engine>,
    pub(crate) name: String,
    pub(crate) root: PathBuf,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("root", &self.root)
            .finish()
    }
}

impl Bucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn object_path(&self, cleaned_key: &str) -> Result<PathBuf, StoreError> {
        join_under_root(&self.root, cleaned_key)
    }

    pub async fn stat(&self, cx: &CancellationToken, key: &str) -> Result<Object, StoreError> {
        check_cancelled(cx)?;
        let key = clean_key(key)?;

        if self.engine.in_memory() {
            let obj = self
                .engine
                .mem
                .get(&self.name, &key)
                .ok_or(StoreError::NotFound)?;
            return Ok(Object::regular(
                &self.name,
                &key,
                obj.data.len() as u64,
                &obj.content_type,
                obj.modified,
            ));
        }

        if self.engine.cache_enabled() {
            if let Some((data, modified)) = self.engine.cache.get_shared(&self.name, &key) {
                return Ok(Object::regular(
                    &self.name,
                    &key,
                    data.len() as u64,
                    DEFAULT_CONTENT_TYPE,
                    modified,
                ));
            }
        }

        let path = self.object_path(&key)?;
        let meta = tokio::fs::metadata(&path).await?;
        let modified = modified_time(&meta);
        let mut object = Object::regular(
            &self.name,
            &key,
            meta.len(),
            DEFAULT_CONTENT_TYPE,
            modified,
        );
        if meta.is_dir() {
            object.is_dir = true;
            object.size = 0;
        }
        Ok(object)
    }

    pub async fn delete(
        &self,
        cx: &CancellationToken,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<(), StoreError> {
        check_cancelled(cx)?;
        let key = clean_key(key)?;

        if self.engine.in_memory() {
            let removed = if opts.recursive {
                self.engine.mem.remove(&self.name, &key);
                self.engine.mem.remove_prefix(&self.name, &format!("{key}/")) > 0
            } else {
                self.engine.mem.remove(&self.name, &key)
            };
            return if removed || opts.recursive {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            };
        }

        let path = self.object_path(&key)?;
        if opts.recursive {
            self.engine.cache.invalidate(&self.name, &key);
            self.engine
                .cache
                .invalidate_prefix(&self.name, &format!("{key}/"));
            let meta = tokio::fs::metadata(&path).await?;
            if meta.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        } else {
            tokio::fs::remove_file(&path).await?;
            self.engine.cache.invalidate(&self.name, &key);
        }
        Ok(())
    }

    /// Copy `src_key` from `src` into this bucket at `dst_key`.
    pub async fn copy_from(
        &self,
        cx: &CancellationToken,
        dst_key: &str,
        src: &Bucket,
        src_key: &str,
    ) -> Result<Object, StoreError> {
        check_cancelled(cx)?;
        let dst_key = clean_key(dst_key)?;
        let src_key = clean_key(src_key)?;

        if self.engine.in_memory() {
            let obj = self
                .engine
                .mem
                .get(&src.name, &src_key)
                .ok_or(StoreError::NotFound)?;
            let size = obj.data.len() as u64;
            self.engine
                .mem
                .put(&self.name, &dst_key, obj.data, obj.content_type.clone());
            return Ok(Object::regular(
                &self.name,
                &dst_key,
                size,
                &obj.content_type,
                Utc::now(),
            ));
        }

        let src_path = src.object_path(&src_key)?;
        let dst_path = self.object_path(&dst_key)?;
        let parent = dst_path.parent().expect("object path has a parent");
        self.engine.dirs.ensure_dir(parent).await?;

        let src_meta = tokio::fs::metadata(&src_path).await?;
        if src_meta.is_dir() {
            return Err(StoreError::PermissionDenied);
        }

        let mut src_file = tokio::fs::File::open(&src_path).await?;
        let temp = temp_path(parent);
        let result = async {
            let mut dst_file = tokio::fs::File::create(&temp).await?;
            let tier = crate::pool::Tier::fitting(src_meta.len())
                .unwrap_or(crate::pool::Tier::Huge);
            let mut buf = self.engine.pools.get(tier);
            let mut total = 0u64;
            loop {
                check_cancelled(cx)?;
                let n = src_file.read(buf.as_mut_slice()).await?;
                if n == 0 {
                    break;
                }
                tokio::io::AsyncWriteExt::write_all(&mut dst_file, &buf.as_slice()[..n])
                    .await?;
                total += n as u64;
            }
            if self.engine.fsync_enabled() {
                dst_file.sync_all().await?;
            }
            Ok::<u64, StoreError>(total)
        }
        .await;

        let total = match result {
            Ok(total) => total,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&temp, &dst_path).await?;
        self.engine.cache.invalidate(&self.name, &dst_key);
        Ok(Object::regular(
            &self.name,
            &dst_key,
            total,
            DEFAULT_CONTENT_TYPE,
            Utc::now(),
        ))
    }

    /// Move `src_key` from `src` into this bucket at `dst_key`. Falls back
    /// to copy-then-delete when rename fails (cross-volume).
    pub async fn move_from(
        &self,
        cx: &CancellationToken,
        dst_key: &str,
        src: &Bucket,
        src_key: &str,
    ) -> Result<Object, StoreError> {
        check_cancelled(cx)?;
        let dst_key = clean_key(dst_key)?;
        let src_key = clean_key(src_key)?;

        if self.engine.in_memory() {
            let object = self.copy_from(cx, &dst_key, src, &src_key).await?;
            self.engine.mem.remove(&src.name, &src_key);
            return Ok(object);
        }

        let src_path = src.object_path(&src_key)?;
        let dst_path = self.object_path(&dst_key)?;
        let parent = dst_path.parent().expect("object path has a parent");
        self.engine.dirs.ensure_dir(parent).await?;

        let size = match tokio::fs::rename(&src_path, &dst_path).await {
            Ok(()) => tokio::fs::metadata(&dst_path).await?.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound);
            }
            Err(e) => {
                tracing::debug!(error = %e, "rename failed, falling back to copy");
                let object = self.copy_from(cx, &dst_key, src, &src_key).await?;
                tokio::fs::remove_file(&src_path).await?;
                object.size
            }
        };
        src.engine.cache.invalidate(&src.name, &src_key);
        self.engine.cache.invalidate(&self.name, &dst_key);
        Ok(Object::regular(
            &self.name,
            &dst_key,
            size,
            DEFAULT_CONTENT_TYPE,
            Utc::now(),
        ))
    }
}

#[cfg(unix)]
async fn create_bucket_dir(path: PathBuf) -> Result<(), StoreError> {
    use std::os::unix::fs::DirBuilderExt;
    tokio::task::spawn_blocking(move || {
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o750);
        builder.create(&path)
    })
    .await
    .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
    Ok(())
}

#[cfg(not(unix))]
async fn create_bucket_dir(path: PathBuf) -> Result<(), StoreError> {
    tokio::fs::create_dir(&path).await?;
    Ok(())
}

pub(crate) fn check_cancelled(cx: &CancellationToken) -> Result<(), StoreError> {
    if cx.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

pub(crate) fn modified_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!(".lake-tmp-{}", uuid::Uuid::new_v4()))
}

/// Read until `buf` is full or the reader hits EOF.
pub(crate) async fn read_full<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
