//! Blob storage seam.
//!
//! Photos and the upload index live in the same store; production runs
//! on S3, single-box deployments on the local filesystem, and tests on
//! the in-memory backend. Conditional puts expose the store's version
//! token (etag) so the index can do compare-and-swap appends.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by blob store backends.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("Invalid blob key: {0}")]
    InvalidKey(String),
    #[error("Blob write failed: {0}")]
    Write(String),
    #[error("Blob read failed: {0}")]
    Read(String),
    #[error("Blob listing failed: {0}")]
    List(String),
}

/// Metadata describing a stored blob.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobMeta {
    /// Store key, e.g. `uploads/1700000000000_cat.jpg`.
    pub key: String,
    /// Public URL recorded in upload records.
    pub url: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
    /// Last-modified time reported by the backend.
    pub uploaded_at: DateTime<Utc>,
    /// Version token for conditional writes, when the backend has one.
    pub etag: Option<String>,
}

/// Outcome of a conditional put.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// The write landed; metadata reflects the new version.
    Stored(BlobMeta),
    /// The precondition failed: someone else changed the blob since the
    /// caller read it (or created it when the caller expected absence).
    Conflict,
}

/// Storage backend for photos and the upload index.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob unconditionally, overwriting any existing version.
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<BlobMeta, BlobStoreError>;

    /// Store a blob only if its current version matches `expected_etag`.
    ///
    /// `None` means the blob must not exist yet. A failed precondition
    /// is a normal outcome, not an error.
    async fn put_conditional(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        expected_etag: Option<String>,
    ) -> Result<PutOutcome, BlobStoreError>;

    /// Fetch a blob's content. `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStoreError>;

    /// Fetch a blob's metadata without its content. `None` when the key
    /// does not exist.
    async fn head(&self, key: &str) -> Result<Option<BlobMeta>, BlobStoreError>;

    /// List blobs whose keys start with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobStoreError>;
}

struct MemoryObject {
    bytes: Bytes,
    uploaded_at: DateTime<Utc>,
    etag: String,
}

/// In-memory blob store.
///
/// Backs tests and ephemeral local runs. Etags are a per-store write
/// counter, so every successful put produces a distinct version token.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, MemoryObject>>,
    versions: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        format!("v{}", self.versions.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn meta_for(key: &str, object: &MemoryObject) -> BlobMeta {
        BlobMeta {
            key: key.to_string(),
            url: format!("memory://{}", key),
            size_bytes: object.bytes.len() as u64,
            uploaded_at: object.uploaded_at,
            etag: Some(object.etag.clone()),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<BlobMeta, BlobStoreError> {
        let object = MemoryObject {
            bytes,
            uploaded_at: Utc::now(),
            etag: self.next_etag(),
        };
        let meta = Self::meta_for(key, &object);
        self.objects.write().await.insert(key.to_string(), object);
        Ok(meta)
    }

    async fn put_conditional(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
        expected_etag: Option<String>,
    ) -> Result<PutOutcome, BlobStoreError> {
        let mut objects = self.objects.write().await;

        let current = objects.get(key).map(|o| o.etag.as_str());
        if current != expected_etag.as_deref() {
            return Ok(PutOutcome::Conflict);
        }

        let object = MemoryObject {
            bytes,
            uploaded_at: Utc::now(),
            etag: self.next_etag(),
        };
        let meta = Self::meta_for(key, &object);
        objects.insert(key.to_string(), object);
        Ok(PutOutcome::Stored(meta))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStoreError> {
        Ok(self.objects.read().await.get(key).map(|o| o.bytes.clone()))
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>, BlobStoreError> {
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|o| Self::meta_for(key, o)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobStoreError> {
        let objects = self.objects.read().await;
        let mut metas: Vec<BlobMeta> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| Self::meta_for(key, object))
            .collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }
}
