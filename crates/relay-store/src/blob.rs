//! Content-addressed blob storage.
//!
//! Blobs are write-once: an upload to an existing name is an error,
//! never an overwrite. Downloads recompute the SHA-256 digest and fail
//! on mismatch, so a corrupted or swapped blob can never flow onward.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

/// Reference to a stored blob: where it lives and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub url: String,
    pub digest: String,
}

/// SHA-256 digest of a byte payload, uppercase hex.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(bytes))
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob under `sub_folder/name`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::BlobExists`] if the name is already taken.
    async fn upload(&self, sub_folder: &str, name: &str, bytes: &[u8]) -> Result<BlobRef>;

    /// Fetch a blob and verify its digest.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::DigestMismatch`] when the stored bytes no
    /// longer hash to `blob.digest`.
    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>>;
}

/// Directory-backed blob store.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, sub_folder: &str, name: &str) -> PathBuf {
        self.root.join(sub_folder).join(name)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, sub_folder: &str, name: &str, bytes: &[u8]) -> Result<BlobRef> {
        let path = self.path_for(sub_folder, name);
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::BlobExists {
                url: path.to_string_lossy().into_owned(),
            });
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        let digest = content_digest(bytes);
        debug!(url = %path.display(), bytes = bytes.len(), "uploaded blob");
        Ok(BlobRef {
            url: path.to_string_lossy().into_owned(),
            digest,
        })
    }

    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(Path::new(&blob.url)).await?;
        verify_digest(&blob.url, &blob.digest, &bytes)?;
        Ok(bytes)
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, sub_folder: &str, name: &str, bytes: &[u8]) -> Result<BlobRef> {
        let url = format!("mem://{sub_folder}/{name}");
        if self.blobs.contains_key(&url) {
            return Err(Error::BlobExists { url });
        }
        self.blobs.insert(url.clone(), bytes.to_vec());
        Ok(BlobRef {
            url,
            digest: content_digest(bytes),
        })
    }

    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let bytes = self
            .blobs
            .get(&blob.url)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::query("blob", format!("Blob not found at '{}'", blob.url)))?;
        verify_digest(&blob.url, &blob.digest, &bytes)?;
        Ok(bytes)
    }
}

fn verify_digest(url: &str, expected: &str, bytes: &[u8]) -> Result<()> {
    let actual = content_digest(bytes);
    if actual != expected {
        return Err(Error::DigestMismatch {
            url: url.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let store = MemoryBlobStore::new();
        let blob = store.upload("reports", "r1.hl7", b"MSH|...").await.unwrap();
        assert!(blob.url.ends_with("reports/r1.hl7"));
        assert_eq!(store.download(&blob).await.unwrap(), b"MSH|...".to_vec());
    }

    #[tokio::test]
    async fn upload_never_overwrites() {
        let store = MemoryBlobStore::new();
        store.upload("reports", "r1.hl7", b"first").await.unwrap();
        let err = store.upload("reports", "r1.hl7", b"second").await.unwrap_err();
        assert!(matches!(err, Error::BlobExists { .. }));
    }

    #[tokio::test]
    async fn download_rejects_digest_mismatch() {
        let store = MemoryBlobStore::new();
        let mut blob = store.upload("reports", "r1.hl7", b"payload").await.unwrap();
        blob.digest = content_digest(b"tampered");
        let err = store.download(&blob).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn local_store_writes_under_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let blob = store.upload("delivery", "out.csv", b"a,b\n1,2\n").await.unwrap();
        assert_eq!(store.download(&blob).await.unwrap(), b"a,b\n1,2\n".to_vec());

        let err = store
            .upload("delivery", "out.csv", b"again")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BlobExists { .. }));
    }

    #[test]
    fn digest_is_uppercase_hex() {
        let digest = content_digest(b"abc");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
