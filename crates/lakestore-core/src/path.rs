use crate::error::StoreError;
use std::path::{Component, Path, PathBuf};

/// Normalize a user-supplied object key into a slash-separated relative
/// path. Rejects empty input and any `..` segment; never touches the
/// filesystem.
pub fn clean_key(raw: &str) -> Result<String, StoreError> {
    if raw.trim().is_empty() {
        return Err(StoreError::InvalidInput("empty object key".into()));
    }
    if raw.contains('\0') {
        return Err(StoreError::InvalidInput("object key contains NUL".into()));
    }
    let normalized = raw.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(StoreError::PermissionDenied),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(StoreError::InvalidInput(format!(
            "object key {raw:?} resolves to nothing"
        )));
    }
    Ok(segments.join("/"))
}

/// Join a cleaned relative key under the root and verify the result cannot
/// escape it. This is the only function that produces filesystem paths; all
/// IO goes through it.
pub fn join_under_root(root: &Path, relative: &str) -> Result<PathBuf, StoreError> {
    let os_relative: PathBuf = relative.split('/').collect();
    let joined = normalize_lexically(&root.join(os_relative));
    let norm_root = normalize_lexically(root);
    match joined.strip_prefix(&norm_root) {
        Ok(rel) if !rel.as_os_str().is_empty() => Ok(joined),
        _ => Err(StoreError::PermissionDenied),
    }
}

/// Sanitize a bucket name into a single safe directory component.
pub fn sanitize_bucket_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "default".into();
    }
    match trimmed {
        "." => return "_.".into(),
        ".." => return "_..".into(),
        _ => {}
    }
    trimmed.replace(['/', '\\'], "_")
}

/// Resolve `.` and `..` components without touching the filesystem. The
/// target may not exist yet, so `canonicalize` is not an option.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            other => result.push(other),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_simple_key() {
        assert_eq!(clean_key("a/b/c.txt").unwrap(), "a/b/c.txt");
    }

    #[test]
    fn test_clean_backslashes() {
        assert_eq!(clean_key("a\\b\\c").unwrap(), "a/b/c");
    }

    #[test]
    fn test_clean_leading_slash() {
        assert_eq!(clean_key("/a/b").unwrap(), "a/b");
        assert_eq!(clean_key("///a").unwrap(), "a");
    }

    #[test]
    fn test_clean_drops_dot_segments() {
        assert_eq!(clean_key("a/./b").unwrap(), "a/b");
        assert_eq!(clean_key("./a").unwrap(), "a");
    }

    #[test]
    fn test_clean_rejects_parent_segments() {
        assert!(matches!(
            clean_key("../escape"),
            Err(StoreError::PermissionDenied)
        ));
        assert!(matches!(
            clean_key("a/../../b"),
            Err(StoreError::PermissionDenied)
        ));
        assert!(matches!(
            clean_key("a/.."),
            Err(StoreError::PermissionDenied)
        ));
    }

    #[test]
    fn test_clean_rejects_empty_and_dot() {
        assert!(matches!(clean_key(""), Err(StoreError::InvalidInput(_))));
        assert!(matches!(clean_key("   "), Err(StoreError::InvalidInput(_))));
        assert!(matches!(clean_key("."), Err(StoreError::InvalidInput(_))));
        assert!(matches!(clean_key("/"), Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn test_clean_rejects_nul() {
        assert!(clean_key("a\0b").is_err());
    }

    #[test]
    fn test_join_confined() {
        let root = Path::new("/data/bucket");
        let p = join_under_root(root, "a/b.txt").unwrap();
        assert_eq!(p, PathBuf::from("/data/bucket/a/b.txt"));
    }

    #[test]
    fn test_join_rejects_escape() {
        let root = Path::new("/data/bucket");
        assert!(matches!(
            join_under_root(root, ".."),
            Err(StoreError::PermissionDenied)
        ));
        // A cleaned key can never contain `..`, but the join re-checks.
        assert!(matches!(
            join_under_root(root, "../../etc/passwd"),
            Err(StoreError::PermissionDenied)
        ));
    }

    #[test]
    fn test_join_rejects_empty_relative() {
        let root = Path::new("/data/bucket");
        assert!(join_under_root(root, "").is_err());
    }

    #[test]
    fn test_sanitize_bucket_names() {
        assert_eq!(sanitize_bucket_name("photos"), "photos");
        assert_eq!(sanitize_bucket_name("  photos  "), "photos");
        assert_eq!(sanitize_bucket_name(""), "default");
        assert_eq!(sanitize_bucket_name("   "), "default");
        assert_eq!(sanitize_bucket_name("."), "_.");
        assert_eq!(sanitize_bucket_name(".."), "_..");
        assert_eq!(sanitize_bucket_name("a/b"), "a_b");
        assert_eq!(sanitize_bucket_name("a\\b"), "a_b");
    }
}
