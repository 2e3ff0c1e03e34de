use crate::error::StoreError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Elide fsync on all write paths, trading durability for throughput.
    pub durability_relaxed: bool,
    /// Serve every operation from the in-memory backend.
    pub in_memory: bool,
    pub cache_enabled: bool,
    pub cache_max_bytes: usize,
    pub cache_max_items: usize,
    pub dir_cache_ttl: Duration,
    pub dir_cache_max_entries: usize,
    /// Shard count for pools and caches; 0 picks the next power of two
    /// at or above the available parallelism.
    pub shard_count: usize,
    pub max_resumable_size: u64,
    pub sigv4_region: String,
    pub sigv4_service: String,
    pub sigv4_allowed_skew: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            durability_relaxed: env::var("LAKESTORE_DURABILITY_RELAXED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.durability_relaxed),
            in_memory: env::var("LAKESTORE_IN_MEMORY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.in_memory),
            cache_enabled: env::var("LAKESTORE_CACHE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.cache_enabled),
            cache_max_bytes: env::var("LAKESTORE_CACHE_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cache_max_bytes),
            cache_max_items: env::var("LAKESTORE_CACHE_MAX_ITEMS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cache_max_items),
            dir_cache_ttl: defaults.dir_cache_ttl,
            dir_cache_max_entries: env::var("LAKESTORE_DIR_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.dir_cache_max_entries),
            shard_count: env::var("LAKESTORE_SHARDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.shard_count),
            max_resumable_size: env::var("LAKESTORE_MAX_RESUMABLE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_resumable_size),
            sigv4_region: env::var("LAKESTORE_REGION")
                .unwrap_or_else(|_| defaults.sigv4_region.clone()),
            sigv4_service: defaults.sigv4_service.clone(),
            sigv4_allowed_skew: defaults.sigv4_allowed_skew,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durability_relaxed: false,
            in_memory: false,
            cache_enabled: true,
            cache_max_bytes: 256 * 1024 * 1024,
            cache_max_items: 50_000,
            dir_cache_ttl: Duration::from_secs(1),
            dir_cache_max_entries: 10_000,
            shard_count: 0,
            max_resumable_size: 1024 * 1024 * 1024,
            sigv4_region: "us-east-1".into(),
            sigv4_service: "s3".into(),
            sigv4_allowed_skew: Duration::from_secs(15 * 60),
        }
    }
}

/// Resolve a root DSN of the form `/abs/path`, `local:/abs/path`, or
/// `file:///abs/path`. Windows drive-letter paths are accepted inside the
/// prefixed forms.
pub fn parse_dsn(dsn: &str) -> Result<PathBuf, StoreError> {
    let dsn = dsn.trim();
    if dsn.is_empty() {
        return Err(StoreError::InvalidInput("empty storage DSN".into()));
    }
    let raw = if let Some(rest) = dsn.strip_prefix("file://") {
        strip_drive_slash(rest)
    } else if let Some(rest) = dsn.strip_prefix("local:") {
        strip_drive_slash(rest)
    } else {
        dsn
    };
    if raw.is_empty() {
        return Err(StoreError::InvalidInput(format!("no path in DSN {dsn:?}")));
    }
    let path = PathBuf::from(raw);
    if !path.is_absolute() && !is_windows_drive(raw) {
        return Err(StoreError::InvalidInput(format!(
            "storage root must be absolute, got {raw:?}"
        )));
    }
    Ok(path)
}

/// `file:///C:/data` carries the drive letter behind an extra slash.
fn strip_drive_slash(rest: &str) -> &str {
    let bytes = rest.as_bytes();
    if bytes.len() >= 3
        && bytes[0] == b'/'
        && bytes[1].is_ascii_alphabetic()
        && bytes[2] == b':'
    {
        &rest[1..]
    } else {
        rest
    }
}

fn is_windows_drive(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_absolute() {
        assert_eq!(parse_dsn("/srv/data").unwrap(), PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_parse_local_prefix() {
        assert_eq!(
            parse_dsn("local:/srv/data").unwrap(),
            PathBuf::from("/srv/data")
        );
    }

    #[test]
    fn test_parse_file_url() {
        assert_eq!(
            parse_dsn("file:///srv/data").unwrap(),
            PathBuf::from("/srv/data")
        );
    }

    #[test]
    fn test_parse_windows_drive_inside_file_url() {
        assert_eq!(
            parse_dsn("file:///C:/data").unwrap(),
            PathBuf::from("C:/data")
        );
    }

    #[test]
    fn test_parse_windows_drive_inside_local() {
        assert_eq!(
            parse_dsn("local:C:/data").unwrap(),
            PathBuf::from("C:/data")
        );
    }

    #[test]
    fn test_reject_relative() {
        assert!(matches!(
            parse_dsn("relative/path"),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reject_empty() {
        assert!(parse_dsn("").is_err());
        assert!(parse_dsn("local:").is_err());
    }

    #[test]
    fn test_default_budgets() {
        let c = EngineConfig::default();
        assert_eq!(c.cache_max_bytes, 256 * 1024 * 1024);
        assert_eq!(c.cache_max_items, 50_000);
        assert_eq!(c.dir_cache_max_entries, 10_000);
        assert_eq!(c.max_resumable_size, 1024 * 1024 * 1024);
    }
}
