use crate::engine::{DEFAULT_CONTENT_TYPE, Object, Store, WriteOptions, check_cancelled};
use crate::error::StoreError;
use crate::pool::Tier;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use http::StatusCode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_CONTENT_TYPE: &str = "application/offset+octet-stream";
pub const TUS_EXTENSIONS: &str = "creation,creation-with-upload,termination";

/// Protocol-level failures of the resumable surface, mapped to wire status
/// codes by the adapter.
#[derive(Debug, thiserror::Error)]
pub enum ResumableError {
    #[error("upload offset {got} does not match current offset {want}")]
    OffsetMismatch { want: u64, got: u64 },
    #[error("unsupported tus version {0:?}")]
    UnsupportedVersion(String),
    #[error("upload exceeds the configured maximum size")]
    TooLarge,
    #[error("invalid resumable request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResumableError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResumableError::OffsetMismatch { .. } => StatusCode::CONFLICT,
            ResumableError::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            ResumableError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ResumableError::Invalid(_) => StatusCode::BAD_REQUEST,
            ResumableError::Store(e) => e.status_code(),
        }
    }
}

/// Per-(bucket, key) upload record. Lives in the engine's process-wide map
/// until the declared length is reached or the upload is deleted.
pub struct ResumableState {
    length: Option<u64>,
    offset: u64,
    staging: PathBuf,
    metadata: HashMap<String, String>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    upsert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumableInfo {
    pub offset: u64,
    /// `None` while the client defers the length.
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ResumableCreate {
    /// Declared upload length; `None` defers it to a later chunk.
    pub length: Option<u64>,
    /// Raw `Upload-Metadata` header value.
    pub metadata_header: Option<String>,
    pub upsert: bool,
}

#[derive(Debug)]
pub struct PatchOutcome {
    pub offset: u64,
    /// Set when this chunk completed the upload.
    pub completed: Option<Object>,
}

impl Store {
    /// `POST`: allocate the staging file and state for a new upload.
    pub async fn resumable_create(
        &self,
        cx: &CancellationToken,
        version: &str,
        bucket: &str,
        key: &str,
        opts: ResumableCreate,
    ) -> Result<ResumableInfo, ResumableError> {
        check_version(version)?;
        check_cancelled(cx)?;
        let bucket = self.bucket(bucket);
        let key = crate::path::clean_key(key).map_err(ResumableError::Store)?;
        if let Some(length) = opts.length {
            if length > self.engine.config.max_resumable_size {
                return Err(ResumableError::TooLarge);
            }
        }
        let metadata = parse_upload_metadata(opts.metadata_header.as_deref())?;

        let state_key = (bucket.name().to_string(), key.clone());
        let prior = self.engine.resumable.lock().get(&state_key).cloned();
        if prior.is_some() && !opts.upsert {
            return Err(StoreError::AlreadyExists.into());
        }
        if prior.is_none() && !opts.upsert {
            match bucket.stat(cx, &key).await {
                Ok(_) => return Err(StoreError::AlreadyExists.into()),
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(prior) = prior {
            // Upsert replaces the previous in-flight upload outright.
            let staging = prior.lock().await.staging.clone();
            let _ = tokio::fs::remove_file(&staging).await;
        }

        let object_path = bucket
            .object_path(&key)
            .map_err(ResumableError::Store)?;
        let parent = object_path.parent().expect("object path has a parent");
        self.engine
            .dirs
            .ensure_dir(parent)
            .await
            .map_err(StoreError::from)?;
        let staging = parent.join(format!(".lake-tmp-resumable-{}", uuid::Uuid::new_v4()));
        tokio::fs::File::create(&staging)
            .await
            .map_err(StoreError::from)?;

        let state = ResumableState {
            length: opts.length,
            offset: 0,
            staging,
            metadata,
            created_at: Utc::now(),
            upsert: opts.upsert,
        };
        self.engine
            .resumable
            .lock()
            .insert(state_key, Arc::new(tokio::sync::Mutex::new(state)));
        Ok(ResumableInfo {
            offset: 0,
            length: opts.length,
        })
    }

    /// `HEAD`: report the current offset and declared length.
    pub async fn resumable_head(
        &self,
        cx: &CancellationToken,
        version: &str,
        bucket: &str,
        key: &str,
    ) -> Result<ResumableInfo, ResumableError> {
        check_version(version)?;
        check_cancelled(cx)?;
        let bucket = self.bucket(bucket);
        let key = crate::path::clean_key(key).map_err(ResumableError::Store)?;
        let entry = self
            .engine
            .resumable
            .lock()
            .get(&(bucket.name().to_string(), key))
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let state = entry.lock().await;
        Ok(ResumableInfo {
            offset: state.offset,
            length: state.length,
        })
    }

    /// `PATCH`: append a chunk at exactly the current offset. Reaching the
    /// declared length finalizes the object through the ordinary write path.
    #[allow(clippy::too_many_arguments)]
    pub async fn resumable_patch<R: AsyncRead + Unpin>(
        &self,
        cx: &CancellationToken,
        version: &str,
        bucket: &str,
        key: &str,
        content_type: &str,
        offset: u64,
        mut chunk: R,
        declared_length: Option<u64>,
    ) -> Result<PatchOutcome, ResumableError> {
        check_version(version)?;
        check_cancelled(cx)?;
        if content_type != TUS_CONTENT_TYPE {
            return Err(ResumableError::Invalid(format!(
                "content type must be {TUS_CONTENT_TYPE}"
            )));
        }
        let bucket = self.bucket(bucket);
        let key = crate::path::clean_key(key).map_err(ResumableError::Store)?;
        let state_key = (bucket.name().to_string(), key.clone());
        let entry = self
            .engine
            .resumable
            .lock()
            .get(&state_key)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        // The per-entry lock is held for the whole append to keep offsets
        // strictly monotonic.
        let mut state = entry.lock().await;

        if let Some(declared) = declared_length {
            if declared > self.engine.config.max_resumable_size {
                return Err(ResumableError::TooLarge);
            }
            if state.length.is_none() {
                state.length = Some(declared);
            }
        }
        if offset != state.offset {
            return Err(ResumableError::OffsetMismatch {
                want: state.offset,
                got: offset,
            });
        }

        let cap = state
            .length
            .unwrap_or(self.engine.config.max_resumable_size);
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&state.staging)
            .await
            .map_err(StoreError::from)?;
        let mut buf = self.engine.pools.get(Tier::Medium);
        let append_result = async {
            let mut appended = 0u64;
            loop {
                check_cancelled(cx)?;
                let n = chunk
                    .read(buf.as_mut_slice())
                    .await
                    .map_err(StoreError::from)?;
                if n == 0 {
                    break;
                }
                if state.offset + appended + n as u64 > cap {
                    return Err(ResumableError::TooLarge);
                }
                file.write_all(&buf.as_slice()[..n])
                    .await
                    .map_err(StoreError::from)?;
                appended += n as u64;
            }
            if self.engine.fsync_enabled() {
                file.sync_all().await.map_err(StoreError::from)?;
            }
            Ok::<u64, ResumableError>(appended)
        }
        .await;
        let appended = match append_result {
            Ok(appended) => appended,
            Err(e) => {
                // Roll the staging file back to the committed offset so a
                // retried chunk starts from a consistent state.
                let _ = file.set_len(state.offset).await;
                return Err(e);
            }
        };
        drop(file);
        state.offset += appended;

        if state.length == Some(state.offset) {
            let object = self.finalize(cx, &bucket, &key, &state).await?;
            self.engine.resumable.lock().remove(&state_key);
            let _ = tokio::fs::remove_file(&state.staging).await;
            return Ok(PatchOutcome {
                offset: state.offset,
                completed: Some(object),
            });
        }
        Ok(PatchOutcome {
            offset: state.offset,
            completed: None,
        })
    }

    /// `DELETE`: drop the upload state and its staging file.
    pub async fn resumable_delete(
        &self,
        cx: &CancellationToken,
        version: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(), ResumableError> {
        check_version(version)?;
        check_cancelled(cx)?;
        let bucket = self.bucket(bucket);
        let key = crate::path::clean_key(key).map_err(ResumableError::Store)?;
        let entry = self
            .engine
            .resumable
            .lock()
            .remove(&(bucket.name().to_string(), key))
            .ok_or(StoreError::NotFound)?;
        let staging = entry.lock().await.staging.clone();
        let _ = tokio::fs::remove_file(&staging).await;
        Ok(())
    }

    async fn finalize(
        &self,
        cx: &CancellationToken,
        bucket: &crate::engine::Bucket,
        key: &str,
        state: &ResumableState,
    ) -> Result<Object, ResumableError> {
        let file = tokio::fs::File::open(&state.staging)
            .await
            .map_err(StoreError::from)?;
        let content_type = state
            .metadata
            .get("contentType")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let opts = WriteOptions {
            upsert: state.upsert,
            metadata: state.metadata.clone(),
            ..WriteOptions::default()
        };
        let object = bucket
            .write(cx, key, file, state.length, content_type, opts)
            .await?;
        Ok(object)
    }
}

fn check_version(version: &str) -> Result<(), ResumableError> {
    if version != TUS_VERSION {
        return Err(ResumableError::UnsupportedVersion(version.to_string()));
    }
    Ok(())
}

/// Parse an `Upload-Metadata` header: comma-separated `key base64value`
/// pairs, value optional.
pub fn parse_upload_metadata(
    header: Option<&str>,
) -> Result<HashMap<String, String>, ResumableError> {
    let mut out = HashMap::new();
    let Some(header) = header else {
        return Ok(out);
    };
    for pair in header.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut words = pair.splitn(2, ' ');
        let key = words.next().unwrap_or_default();
        if key.is_empty() {
            return Err(ResumableError::Invalid("empty metadata key".into()));
        }
        let value = match words.next().map(str::trim) {
            None | Some("") => String::new(),
            Some(encoded) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .or_else(|_| {
                        base64::engine::general_purpose::STANDARD_NO_PAD.decode(encoded)
                    })
                    .map_err(|_| {
                        ResumableError::Invalid(format!(
                            "metadata value for {key:?} is not base64"
                        ))
                    })?;
                String::from_utf8(decoded).map_err(|_| {
                    ResumableError::Invalid(format!(
                        "metadata value for {key:?} is not utf-8"
                    ))
                })?
            }
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_check() {
        assert!(check_version("1.0.0").is_ok());
        assert!(matches!(
            check_version("0.2.2"),
            Err(ResumableError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_parse_metadata_pairs() {
        let parsed =
            parse_upload_metadata(Some("filename aGVsbG8udHh0, contentType dGV4dC9wbGFpbg=="))
                .unwrap();
        assert_eq!(parsed["filename"], "hello.txt");
        assert_eq!(parsed["contentType"], "text/plain");
    }

    #[test]
    fn test_parse_metadata_key_only() {
        let parsed = parse_upload_metadata(Some("is-draft")).unwrap();
        assert_eq!(parsed["is-draft"], "");
    }

    #[test]
    fn test_parse_metadata_absent() {
        assert!(parse_upload_metadata(None).unwrap().is_empty());
        assert!(parse_upload_metadata(Some("")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_metadata_rejects_garbage() {
        assert!(parse_upload_metadata(Some("name !!notbase64!!")).is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ResumableError::OffsetMismatch { want: 5, got: 7 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ResumableError::UnsupportedVersion("0.1".into()).status_code(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ResumableError::TooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ResumableError::Store(StoreError::NotFound).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
