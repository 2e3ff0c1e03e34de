use super::{Bucket, check_cancelled, read_full, temp_path};
use crate::engine::object::{Object, WriteOptions};
use crate::error::StoreError;
use crate::hotcache::CACHEABLE_MAX;
use crate::pool::Tier;
use chrono::Utc;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Largest declared size served by the single-small-buffer strategy.
const SMALL_WRITE_MAX: u64 = 8 * 1024;
/// Declared sizes at or above this go through the parallel chunked writer.
const PARALLEL_WRITE_MIN: u64 = 32 * 1024 * 1024;
const WRITE_CHUNK: usize = 4 * 1024 * 1024;
const PARALLEL_WRITERS: usize = 4;

impl Bucket {
    /// Store an object. The destination reflects either the complete prior
    /// version or the complete new version, never a partial write.
    pub async fn write<R: AsyncRead + Unpin>(
        &self,
        cx: &CancellationToken,
        key: &str,
        mut reader: R,
        size: Option<u64>,
        content_type: &str,
        opts: WriteOptions,
    ) -> Result<Object, StoreError> {
        check_cancelled(cx)?;
        let key = crate::path::clean_key(key)?;

        if self.engine.in_memory() {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            let size = data.len() as u64;
            self.engine
                .mem
                .put(&self.name, &key, data.into(), content_type.to_string());
            let mut object =
                Object::regular(&self.name, &key, size, content_type, Utc::now());
            object.metadata = opts.metadata;
            return Ok(object);
        }

        let path = self.object_path(&key)?;
        let parent = path.parent().expect("object path has a parent");
        self.engine.dirs.ensure_dir(parent).await?;

        if !opts.upsert && tokio::fs::metadata(&path).await.is_ok() {
            return Err(StoreError::AlreadyExists);
        }

        let modified = Utc::now();
        let written = match size {
            Some(s) if s <= SMALL_WRITE_MAX => {
                self.write_buffered(cx, &key, &mut reader, &path, s, modified)
                    .await?
            }
            Some(s) if s <= CACHEABLE_MAX as u64 => {
                self.write_buffered(cx, &key, &mut reader, &path, s, modified)
                    .await?
            }
            Some(s) if s >= PARALLEL_WRITE_MIN => {
                self.write_parallel(cx, &key, &mut reader, &path, s).await?
            }
            _ => self.write_streamed(cx, &key, &mut reader, &path).await?,
        };

        let mut object = Object::regular(&self.name, &key, written, content_type, modified);
        object.metadata = opts.metadata;
        Ok(object)
    }

    /// Tiny objects: one pooled buffer, one write syscall when durability is
    /// relaxed, write-through into the hot cache.
    async fn write_buffered<R: AsyncRead + Unpin>(
        &self,
        cx: &CancellationToken,
        key: &str,
        reader: &mut R,
        path: &Path,
        declared: u64,
        modified: chrono::DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let tier = Tier::fitting(declared).unwrap_or(Tier::Large);
        let mut buf = self.engine.pools.get(tier);
        let n = read_full(reader, buf.as_mut_slice()).await?;
        if n == buf.len() {
            // The buffer filled completely; make sure nothing is left over.
            let mut probe = [0u8; 1];
            if reader.read(&mut probe).await? != 0 {
                return Err(StoreError::InvalidInput(format!(
                    "content exceeds declared size {declared}"
                )));
            }
        }
        check_cancelled(cx)?;

        let data = &buf.as_slice()[..n];
        if self.engine.fsync_enabled() {
            let mut file = tokio::fs::File::create(path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        } else {
            tokio::fs::write(path, data).await?;
        }

        if self.engine.cache_enabled() {
            self.engine.cache.put(&self.name, key, data, modified);
        }
        Ok(n as u64)
    }

    /// Mid-sized or unknown-length objects: stream through a pooled buffer
    /// into a temp file, then atomically rename over the destination.
    async fn write_streamed<R: AsyncRead + Unpin>(
        &self,
        cx: &CancellationToken,
        key: &str,
        reader: &mut R,
        path: &Path,
    ) -> Result<u64, StoreError> {
        let parent = path.parent().expect("object path has a parent");
        let temp = temp_path(parent);

        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            let mut buf = self.engine.pools.get(Tier::Huge);
            let mut total = 0u64;
            loop {
                check_cancelled(cx)?;
                let n = reader.read(buf.as_mut_slice()).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf.as_slice()[..n]).await?;
                total += n as u64;
            }
            if self.engine.fsync_enabled() {
                file.sync_all().await?;
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
        tokio::fs::rename(&temp, path).await?;
        self.engine.cache.invalidate(&self.name, key);
        Ok(total)
    }

    /// Large declared sizes: preallocate the destination and fan 4 MiB
    /// chunks out to positional writers. Any failure deletes the
    /// destination before surfacing.
    #[cfg(unix)]
    async fn write_parallel<R: AsyncRead + Unpin>(
        &self,
        cx: &CancellationToken,
        key: &str,
        reader: &mut R,
        path: &Path,
        declared: u64,
    ) -> Result<u64, StoreError> {
        use std::os::unix::fs::FileExt;

        let open_path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&open_path)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        if let Err(e) = self.engine.platform.preallocate(&file, declared) {
            tracing::debug!(error = %e, "preallocation unavailable");
        }

        let file = std::sync::Arc::new(file);
        let mut workers = tokio::task::JoinSet::new();
        let result = async {
            let mut offset = 0u64;
            loop {
                check_cancelled(cx)?;
                let mut buf = self.engine.pools.get(Tier::Huge);
                let n = read_full(reader, &mut buf.as_mut_slice()[..WRITE_CHUNK]).await?;
                if n == 0 {
                    break;
                }
                while workers.len() >= PARALLEL_WRITERS {
                    join_writer(&mut workers).await?;
                }
                let chunk_file = std::sync::Arc::clone(&file);
                let chunk_offset = offset;
                workers.spawn_blocking(move || {
                    chunk_file.write_all_at(&buf.as_slice()[..n], chunk_offset)
                });
                offset += n as u64;
            }
            while !workers.is_empty() {
                join_writer(&mut workers).await?;
            }
            if self.engine.fsync_enabled() {
                let sync_file = std::sync::Arc::clone(&file);
                tokio::task::spawn_blocking(move || sync_file.sync_all())
                    .await
                    .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
            }
            Ok::<u64, StoreError>(offset)
        }
        .await;

        match result {
            Ok(total) => {
                self.engine.cache.invalidate(&self.name, key);
                Ok(total)
            }
            Err(e) => {
                workers.shutdown().await;
                let _ = tokio::fs::remove_file(path).await;
                Err(e)
            }
        }
    }

    #[cfg(not(unix))]
    async fn write_parallel<R: AsyncRead + Unpin>(
        &self,
        cx: &CancellationToken,
        key: &str,
        reader: &mut R,
        path: &Path,
        _declared: u64,
    ) -> Result<u64, StoreError> {
        self.write_streamed(cx, key, reader, path).await
    }
}

#[cfg(unix)]
async fn join_writer(
    workers: &mut tokio::task::JoinSet<std::io::Result<()>>,
) -> Result<(), StoreError> {
    match workers.join_next().await {
        Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(e))) => Err(e.into()),
        Some(Err(e)) => Err(StoreError::Io(std::io::Error::other(e))),
        None => Ok(()),
    }
}
