//! Manifest checksums for cheap change detection
//!
//! The manifest checksum is SHA-256 over the version string followed by one
//! `path:sha256` line per file, sorted ASCII-ascending by path. It depends
//! only on the set of `(path, per-file hash)` pairs and the version string,
//! so a node can detect change without downloading the bundle.

use sha2::{Digest, Sha256};

/// SHA-256 of raw bytes, lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Compute the manifest checksum for a resolved version
///
/// `files` holds `(relative path, per-file sha256)` pairs in any order.
pub fn manifest_checksum(version: &str, files: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = files.iter().collect();
    sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update(b"\n");
    for (path, file_hash) in sorted {
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(file_hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, content: &[u8]) -> (String, String) {
        (path.to_string(), sha256_hex(content))
    }

    #[test]
    fn test_sha256_hex() {
        // Well-known digest of the empty input.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum_stable_under_reordering() {
        let a = vec![entry("main.dsc.yaml", b"x"), entry("lib/util.yaml", b"y")];
        let b = vec![entry("lib/util.yaml", b"y"), entry("main.dsc.yaml", b"x")];
        assert_eq!(manifest_checksum("1.0.0", &a), manifest_checksum("1.0.0", &b));
    }

    #[test]
    fn test_checksum_depends_on_version() {
        let files = vec![entry("main.dsc.yaml", b"x")];
        assert_ne!(
            manifest_checksum("1.0.0", &files),
            manifest_checksum("1.0.1", &files)
        );
    }

    #[test]
    fn test_checksum_depends_on_content() {
        let a = vec![entry("main.dsc.yaml", b"x")];
        let b = vec![entry("main.dsc.yaml", b"changed")];
        assert_ne!(manifest_checksum("1.0.0", &a), manifest_checksum("1.0.0", &b));
    }

    #[test]
    fn test_checksum_depends_on_paths() {
        let a = vec![entry("main.dsc.yaml", b"x")];
        let b = vec![entry("other.dsc.yaml", b"x")];
        assert_ne!(manifest_checksum("1.0.0", &a), manifest_checksum("1.0.0", &b));
    }
}
