//! Name and path validation shared by upload and bundle build

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

/// Validate a configuration, composite, or scope value name
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid name {:?}: only letters, digits, '_', '.' and '-' are allowed",
            name
        )))
    }
}

/// Validate and normalize a relative bundle path
///
/// Backslashes are normalized to forward slashes. Absolute paths, empty
/// segments, `.` and `..` segments are rejected. Enforced at upload and
/// re-checked at bundle build.
pub fn normalize_relative_path(path: &str) -> Result<String> {
    let normalized = path.replace('\\', "/");

    if normalized.is_empty() {
        return Err(Error::Validation("empty path".into()));
    }
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(Error::Validation(format!("absolute path not allowed: {:?}", path)));
    }
    for segment in normalized.split('/') {
        match segment {
            "" => return Err(Error::Validation(format!("empty path segment in {:?}", path))),
            "." | ".." => {
                return Err(Error::Validation(format!(
                    "path segment {:?} not allowed in {:?}",
                    segment, path
                )))
            }
            _ => {}
        }
    }
    Ok(normalized)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["WebServer", "db_01", "my.config", "a-b"] {
            assert!(validate_name(name).is_ok(), "{name} rejected");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "a b", "a/b", "a\\b", "näme", "a:b"] {
            assert!(validate_name(name).is_err(), "{name} accepted");
        }
    }

    #[test]
    fn test_normalize_backslashes() {
        assert_eq!(
            normalize_relative_path("lib\\util.yaml").unwrap(),
            "lib/util.yaml"
        );
    }

    #[test]
    fn test_rejects_traversal() {
        for path in ["../etc/passwd", "a/../b", "a/..", ".."] {
            assert!(normalize_relative_path(path).is_err(), "{path} accepted");
        }
    }

    #[test]
    fn test_rejects_absolute() {
        for path in ["/etc/passwd", "C:\\windows\\system32", "c:/x"] {
            assert!(normalize_relative_path(path).is_err(), "{path} accepted");
        }
    }

    #[test]
    fn test_rejects_empty_segments() {
        for path in ["a//b", "a/", "", "./a"] {
            assert!(normalize_relative_path(path).is_err(), "{path} accepted");
        }
    }

    #[test]
    fn test_plain_relative_path() {
        assert_eq!(
            normalize_relative_path("scripts/install.sh").unwrap(),
            "scripts/install.sh"
        );
    }
}
