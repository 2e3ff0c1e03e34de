use super::{Bucket, check_cancelled, modified_time};
use crate::engine::object::{ListEntry, ListOptions};
use crate::error::StoreError;
use crate::multipart::MULTIPART_DIR;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

impl Bucket {
    /// Enumerate objects under `prefix`. Results are sorted by key, then
    /// paginated with `offset` and `limit` (0 = unlimited). The multipart
    /// staging subtree is never reported.
    pub async fn list(
        &self,
        cx: &CancellationToken,
        prefix: &str,
        limit: usize,
        offset: usize,
        opts: ListOptions,
    ) -> Result<Vec<ListEntry>, StoreError> {
        check_cancelled(cx)?;

        let cleaned_prefix = if prefix.trim().is_empty() {
            String::new()
        } else {
            crate::path::clean_key(prefix)?
        };
        if cleaned_prefix == MULTIPART_DIR
            || cleaned_prefix.starts_with(&format!("{MULTIPART_DIR}/"))
        {
            return Ok(Vec::new());
        }

        let mut entries = if self.engine.in_memory() {
            self.list_in_memory(&cleaned_prefix, &opts)
        } else {
            self.list_filesystem(cx, &cleaned_prefix, &opts).await?
        };

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let entries: Vec<ListEntry> = entries.into_iter().skip(offset).collect();
        if limit > 0 && entries.len() > limit {
            Ok(entries.into_iter().take(limit).collect())
        } else {
            Ok(entries)
        }
    }

    fn list_in_memory(&self, prefix: &str, opts: &ListOptions) -> Vec<ListEntry> {
        if opts.dirs_only {
            return Vec::new();
        }
        self.engine
            .mem
            .entries(&self.name, prefix)
            .into_iter()
            .map(|(key, size, modified)| ListEntry {
                key,
                size,
                is_dir: false,
                last_modified: modified,
            })
            .collect()
    }

    async fn list_filesystem(
        &self,
        cx: &CancellationToken,
        prefix: &str,
        opts: &ListOptions,
    ) -> Result<Vec<ListEntry>, StoreError> {
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.object_path(prefix)?
        };

        let mut out = Vec::new();
        let mut pending: Vec<PathBuf> = vec![base];
        while let Some(dir) = pending.pop() {
            check_cancelled(cx)?;
            // Per-entry walk errors are skipped; a missing prefix directory
            // yields an empty listing.
            let Ok(mut rd) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            loop {
                let entry = match rd.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(_) => break,
                };
                let name = entry.file_name();
                if dir == self.root && name == MULTIPART_DIR {
                    continue;
                }
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_symlink() {
                    continue;
                }
                let Ok(key) = slash_key(&self.root, &entry.path()) else {
                    continue;
                };
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if file_type.is_dir() {
                    if !opts.files_only {
                        out.push(ListEntry {
                            key,
                            size: 0,
                            is_dir: true,
                            last_modified: modified_time(&meta),
                        });
                    }
                    if opts.recursive {
                        pending.push(entry.path());
                    }
                } else if !opts.dirs_only {
                    out.push(ListEntry {
                        key,
                        size: meta.len(),
                        is_dir: false,
                        last_modified: modified_time(&meta),
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Canonical slash-separated key of `path` relative to the bucket root.
fn slash_key(root: &Path, path: &Path) -> Result<String, StoreError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| StoreError::PermissionDenied)?;
    let mut key = String::new();
    for component in rel.components() {
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_key() {
        let root = Path::new("/data/b");
        assert_eq!(
            slash_key(root, Path::new("/data/b/x/y.txt")).unwrap(),
            "x/y.txt"
        );
        assert_eq!(slash_key(root, Path::new("/data/b/top")).unwrap(), "top");
        assert!(slash_key(root, Path::new("/data/other/f")).is_err());
    }
}
