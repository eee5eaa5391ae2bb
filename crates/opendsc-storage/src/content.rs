//! Content-addressed blob store
//!
//! Blobs are stored under the root as `<aa>/<rest-of-hash>` where `aa` is
//! the first two hex characters of the SHA-256 digest. Writes go through a
//! temp file and rename so a crash never leaves a partial blob under its
//! final name. Deletes are idempotent.

use std::path::{Path, PathBuf};

use opendsc_core::manifest::sha256_hex;
use opendsc_core::{Error, Result};

/// Filesystem-backed content store
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(Error::Validation(format!("invalid content hash: {:?}", hash)));
        }
        Ok(self.root.join(&hash[..2]).join(&hash[2..]))
    }

    /// Store bytes, returning their hash; storing the same bytes twice is a
    /// no-op
    pub async fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = sha256_hex(bytes);
        let path = self.blob_path(&hash)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }
        let parent = path.parent().expect("blob path has a parent");
        tokio::fs::create_dir_all(parent).await?;

        let tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::TransientIo(format!("create temp blob: {}", e)))?;
        tokio::fs::write(tmp.path(), bytes).await?;
        tmp.persist(&path)
            .map_err(|e| Error::TransientIo(format!("persist blob {}: {}", hash, e)))?;
        Ok(hash)
    }

    /// Read a blob; `None` when the metadata outlived the content
    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(hash)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a blob that must exist
    pub async fn get_required(&self, hash: &str) -> Result<Vec<u8>> {
        self.get(hash).await?.ok_or_else(|| {
            Error::Integrity(format!("content {} is missing from the store", hash))
        })
    }

    /// Whether a blob exists
    pub async fn exists(&self, hash: &str) -> Result<bool> {
        let path = self.blob_path(hash)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Delete a blob; deleting an absent blob succeeds and reports 0 bytes
    pub async fn delete(&self, hash: &str) -> Result<u64> {
        let path = self.blob_path(hash)?;
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let hash = store.put(b"hello world").await.unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(store.get(&hash).await.unwrap().unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let first = store.put(b"same bytes").await.unwrap();
        let second = store.put(b"same bytes").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let absent = "0".repeat(64);
        assert!(store.get(&absent).await.unwrap().is_none());
        assert!(store.get_required(&absent).await.unwrap_err().is_integrity());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let hash = store.put(b"to delete").await.unwrap();
        let freed = store.delete(&hash).await.unwrap();
        assert_eq!(freed, 9);
        assert_eq!(store.delete(&hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        assert!(store.get("../../etc/passwd").await.is_err());
        assert!(store.get("ABCD").await.is_err());
    }
}
