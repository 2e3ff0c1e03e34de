use crate::engine::{Bucket, Object, check_cancelled, read_full, temp_path};
use crate::error::StoreError;
use crate::pool::Tier;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const MULTIPART_DIR: &str = "_multipart";
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Staging metadata, written once at init as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadMeta {
    bucket: String,
    key: String,
    content_type: String,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub number: u32,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletedPart {
    pub number: u32,
    pub size: u64,
}

/// Handle over one in-progress multipart upload's staging directory.
pub struct MultipartUpload {
    bucket: Bucket,
    id: String,
}

impl Bucket {
    /// Start a multipart upload for `key`.
    pub async fn create_multipart(
        &self,
        cx: &CancellationToken,
        key: &str,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<MultipartUpload, StoreError> {
        check_cancelled(cx)?;
        let key = crate::path::clean_key(key)?;
        let id = generate_upload_id();
        let upload = MultipartUpload {
            bucket: self.clone(),
            id,
        };

        let staging = upload.staging_dir();
        self.engine.dirs.ensure_dir(&staging).await?;

        let meta = UploadMeta {
            bucket: self.name.clone(),
            key,
            content_type: content_type.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&meta)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let mut file = open_meta_file(&staging.join("meta.json")).await?;
        file.write_all(&payload).await?;
        if self.engine.fsync_enabled() {
            file.sync_all().await?;
        }
        Ok(upload)
    }

    /// Attach to an existing upload by id. The id is validated so it can
    /// never address anything outside the staging tree.
    pub fn multipart_upload(&self, id: &str) -> Result<MultipartUpload, StoreError> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StoreError::InvalidInput(format!("invalid upload id {id:?}")));
        }
        Ok(MultipartUpload {
            bucket: self.clone(),
            id: id.to_string(),
        })
    }
}

impl MultipartUpload {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn staging_dir(&self) -> PathBuf {
        self.bucket.root.join(MULTIPART_DIR).join(&self.id)
    }

    fn part_path(&self, number: u32) -> PathBuf {
        self.staging_dir().join(format!("part-{number:05}"))
    }

    async fn load_meta(&self) -> Result<UploadMeta, StoreError> {
        let raw = tokio::fs::read(self.staging_dir().join("meta.json")).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            tracing::error!(upload = %self.id, error = %e, "corrupt upload metadata");
            StoreError::Io(std::io::Error::other(e))
        })
    }

    /// Store one part. Parts may be uploaded concurrently; each lands via
    /// its own temp file and rename.
    pub async fn upload_part<R: AsyncRead + Unpin>(
        &self,
        cx: &CancellationToken,
        number: u32,
        mut reader: R,
        size: Option<u64>,
    ) -> Result<PartInfo, StoreError> {
        check_cancelled(cx)?;
        if number < 1 || number > MAX_PART_NUMBER {
            return Err(StoreError::InvalidInput(format!(
                "part number {number} outside [1, {MAX_PART_NUMBER}]"
            )));
        }
        self.load_meta().await?;

        let staging = self.staging_dir();
        let temp = temp_path(&staging);
        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            let tier = size.and_then(Tier::fitting).unwrap_or(Tier::Huge);
            let mut buf = self.bucket.engine.pools.get(tier);
            let mut total = 0u64;
            loop {
                check_cancelled(cx)?;
                let n = read_full(&mut reader, buf.as_mut_slice()).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf.as_slice()[..n]).await?;
                total += n as u64;
            }
            if self.bucket.engine.fsync_enabled() {
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
        tokio::fs::rename(&temp, self.part_path(number)).await?;
        Ok(PartInfo {
            number,
            size: total,
            etag: part_etag(number, total),
            last_modified: Utc::now(),
        })
    }

    /// Server-side part copies are not available on the local backend.
    pub async fn copy_part(
        &self,
        _cx: &CancellationToken,
        _number: u32,
        _src_bucket: &str,
        _src_key: &str,
    ) -> Result<PartInfo, StoreError> {
        Err(StoreError::Unsupported)
    }

    /// Enumerate uploaded parts in ascending part-number order.
    pub async fn list_parts(
        &self,
        cx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PartInfo>, StoreError> {
        check_cancelled(cx)?;
        let mut rd = tokio::fs::read_dir(self.staging_dir()).await?;
        let mut parts = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(number) = name
                .strip_prefix("part-")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            parts.push(PartInfo {
                number,
                size: meta.len(),
                etag: part_etag(number, meta.len()),
                last_modified: crate::engine::modified_time(&meta),
            });
        }
        parts.sort_by_key(|p| p.number);
        let parts: Vec<PartInfo> = parts.into_iter().skip(offset).collect();
        if limit > 0 && parts.len() > limit {
            Ok(parts.into_iter().take(limit).collect())
        } else {
            Ok(parts)
        }
    }

    /// Assemble the listed parts, in ascending part-number order, into the
    /// final object, then drop the staging directory.
    pub async fn complete(
        &self,
        cx: &CancellationToken,
        parts: &[CompletedPart],
    ) -> Result<Object, StoreError> {
        check_cancelled(cx)?;
        let meta = self.load_meta().await?;

        let mut ordered: Vec<CompletedPart> = parts.to_vec();
        ordered.sort_by_key(|p| p.number);

        let dst_path = self.bucket.object_path(&meta.key)?;
        let parent = dst_path.parent().expect("object path has a parent");
        self.bucket.engine.dirs.ensure_dir(parent).await?;

        let temp = temp_path(parent);
        let staging = self.staging_dir();
        let platform = std::sync::Arc::clone(&self.bucket.engine.platform);
        let fsync = self.bucket.engine.fsync_enabled();
        let cancel = cx.clone();
        let assemble_temp = temp.clone();
        let assemble_dst = dst_path.clone();
        let part_paths: Vec<(u32, PathBuf)> = ordered
            .iter()
            .map(|p| (p.number, staging.join(format!("part-{:05}", p.number))))
            .collect();

        let result = tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let mut dst = std::fs::File::create(&assemble_temp)?;
            let mut total = 0u64;
            for (number, path) in &part_paths {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                let mut src = match std::fs::File::open(path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::error!(part = *number, "part missing at assembly");
                        return Err(StoreError::NotFound);
                    }
                    Err(e) => return Err(e.into()),
                };
                let len = src.metadata()?.len();
                let copied = platform.copy_range(&mut src, &mut dst, len)?;
                total += copied;
            }
            if fsync {
                dst.sync_all()?;
            }
            drop(dst);
            std::fs::rename(&assemble_temp, &assemble_dst)?;
            Ok(total)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

        let total = match result {
            Ok(total) => total,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        self.remove_staging().await;
        self.bucket
            .engine
            .cache
            .invalidate(&self.bucket.name, &meta.key);

        let mut object = Object::regular(
            &meta.bucket,
            &meta.key,
            total,
            &meta.content_type,
            Utc::now(),
        );
        object.created_at = meta.created_at;
        object.metadata = meta.metadata;
        Ok(object)
    }

    /// Drop the upload and its staging directory. Absent staging is not an
    /// error.
    pub async fn abort(&self, cx: &CancellationToken) -> Result<(), StoreError> {
        check_cancelled(cx)?;
        match tokio::fs::remove_dir_all(self.staging_dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort staging cleanup: batch-unlink the contents through the
    /// platform adapter, then drop the directory.
    async fn remove_staging(&self) {
        let staging = self.staging_dir();
        let platform = std::sync::Arc::clone(&self.bucket.engine.platform);
        let cleanup = tokio::task::spawn_blocking(move || {
            let names: Vec<std::ffi::OsString> = std::fs::read_dir(&staging)
                .map(|rd| {
                    rd.filter_map(|e| e.ok().map(|e| e.file_name()))
                        .collect()
                })
                .unwrap_or_default();
            platform.batch_unlink(&staging, &names)?;
            std::fs::remove_dir(&staging)
        })
        .await;
        match cleanup {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(upload = %self.id, error = %e, "staging cleanup incomplete");
            }
            Err(e) => {
                tracing::debug!(upload = %self.id, error = %e, "staging cleanup task failed");
            }
        }
    }
}

fn part_etag(number: u32, size: u64) -> String {
    format!("{number}-{size:x}")
}

/// Process-unique upload id: a high-resolution timestamp plus 8 random
/// bytes. When secure random is unavailable a fixed tail stands in,
/// accepting reduced collision protection.
fn generate_upload_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut tail = [0u8; 8];
    match rand::rngs::OsRng.try_fill_bytes(&mut tail) {
        Ok(()) => format!("{nanos:x}-{}", hex::encode(tail)),
        Err(e) => {
            tracing::warn!(error = %e, "secure random unavailable for upload id");
            format!("{nanos:x}-0000000000000000")
        }
    }
}

#[cfg(unix)]
async fn open_meta_file(path: &std::path::Path) -> Result<tokio::fs::File, StoreError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await?;
    Ok(file)
}

#[cfg(not(unix))]
async fn open_meta_file(path: &std::path::Path) -> Result<tokio::fs::File, StoreError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    Ok(file)
}
