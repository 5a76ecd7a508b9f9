//! Filesystem blob store.
//!
//! Backs single-box deployments where an external static server exposes
//! the root directory; stored blobs are addressed by root-relative URLs
//! (`/uploads/<name>`). Writes go through a temp file plus rename, and
//! conditional writes are serialized behind a process-level mutex, which
//! makes compare-and-swap sound for the one-server deployments this
//! backend is meant for.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blob_store::{BlobMeta, BlobStore, BlobStoreError, PutOutcome};
use crate::config::FilesystemConfig;

/// Blob store over a local directory.
pub struct FsBlobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsBlobStore {
    pub fn new(config: &FilesystemConfig) -> Self {
        info!(root = %config.root.display(), "Filesystem blob store initialized");
        Self {
            root: config.root.clone(),
            write_lock: Mutex::new(()),
        }
    }

    /// Join a root-relative path, rejecting traversal components.
    fn checked_path(&self, relative: &str) -> Result<PathBuf, BlobStoreError> {
        let traversal = relative
            .split('/')
            .any(|part| part == ".." || part == ".");
        if traversal || relative.contains('\\') {
            return Err(BlobStoreError::InvalidKey(relative.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        if key.is_empty() || key.ends_with('/') {
            return Err(BlobStoreError::InvalidKey(key.to_string()));
        }
        self.checked_path(key)
    }

    fn meta_for(key: &str, meta: &std::fs::Metadata) -> BlobMeta {
        let uploaded_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        BlobMeta {
            key: key.to_string(),
            url: format!("/{}", key),
            size_bytes: meta.len(),
            uploaded_at,
            etag: etag_from(meta),
        }
    }

    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Temp file + rename so readers never observe a partial blob.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no file name"))?;
        let tmp = path.with_file_name(format!("{}.tmp-{}", file_name, Uuid::new_v4().simple()));

        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn current_etag(&self, path: &Path) -> Result<Option<String>, BlobStoreError> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(etag_from(&meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobStoreError::Read(format!("{}: {}", path.display(), e))),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<BlobMeta, BlobStoreError> {
        let path = self.key_path(key)?;
        self.write_bytes(&path, &bytes)
            .await
            .map_err(|e| BlobStoreError::Write(format!("{}: {}", path.display(), e)))?;

        let meta = fs::metadata(&path)
            .await
            .map_err(|e| BlobStoreError::Write(format!("{}: {}", path.display(), e)))?;

        debug!(key = %key, size_bytes = meta.len(), "Blob written");
        Ok(Self::meta_for(key, &meta))
    }

    async fn put_conditional(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
        expected_etag: Option<String>,
    ) -> Result<PutOutcome, BlobStoreError> {
        let path = self.key_path(key)?;
        let _guard = self.write_lock.lock().await;

        let current = self.current_etag(&path).await?;
        if current != expected_etag {
            return Ok(PutOutcome::Conflict);
        }

        self.write_bytes(&path, &bytes)
            .await
            .map_err(|e| BlobStoreError::Write(format!("{}: {}", path.display(), e)))?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| BlobStoreError::Write(format!("{}: {}", path.display(), e)))?;

        Ok(PutOutcome::Stored(Self::meta_for(key, &meta)))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStoreError> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobStoreError::Read(format!("{}: {}", path.display(), e))),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>, BlobStoreError> {
        let path = self.key_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(Self::meta_for(key, &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobStoreError::Read(format!("{}: {}", path.display(), e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobStoreError> {
        // A prefix may end mid-filename ("data/uploads.json" matches
        // suffixed variants), so split into directory and name prefix.
        let (dir, name_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };
        let dir_path = self.checked_path(dir)?;

        let mut entries = match fs::read_dir(&dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BlobStoreError::List(format!(
                    "{}: {}",
                    dir_path.display(),
                    e
                )))
            }
        };

        let mut metas = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| BlobStoreError::List(format!("{}: {}", dir_path.display(), e)))?;
            let Some(entry) = entry else { break };

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(name_prefix) {
                continue;
            }

            let meta = entry
                .metadata()
                .await
                .map_err(|e| BlobStoreError::List(format!("{}: {}", dir_path.display(), e)))?;
            if !meta.is_file() {
                continue;
            }

            let key = if dir.is_empty() {
                name
            } else {
                format!("{}/{}", dir, name)
            };
            metas.push(Self::meta_for(&key, &meta));
        }

        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }
}

/// Version token from file metadata: size plus mtime. Distinct versions
/// of the index document always differ in size, so collisions across
/// the load-save window do not arise in practice.
fn etag_from(meta: &std::fs::Metadata) -> Option<String> {
    let modified = meta.modified().ok()?;
    let nanos = modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_nanos();
    Some(format!("{:x}-{:x}", meta.len(), nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (FsBlobStore, PathBuf) {
        let root = std::env::temp_dir().join(format!("snapmap-test-{}", Uuid::new_v4().simple()));
        let config = FilesystemConfig { root: root.clone() };
        (FsBlobStore::new(&config), root)
    }

    #[tokio::test]
    async fn test_put_creates_directories_and_reads_back() {
        let (store, root) = temp_store();

        let meta = store
            .put("uploads/1_cat.jpg", Bytes::from_static(b"jpeg-bytes"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(meta.url, "/uploads/1_cat.jpg");
        assert_eq!(meta.size_bytes, 10);
        assert!(meta.etag.is_some());

        let bytes = store.get("uploads/1_cat.jpg").await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), b"jpeg-bytes");

        let head = store.head("uploads/1_cat.jpg").await.unwrap().unwrap();
        assert_eq!(head.size_bytes, 10);

        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let (store, root) = temp_store();
        assert!(store.get("uploads/none.jpg").await.unwrap().is_none());
        assert!(store.head("uploads/none.jpg").await.unwrap().is_none());
        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_traversal_keys_are_rejected() {
        let (store, root) = temp_store();
        let err = store
            .put("../escape.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::InvalidKey(_)));

        let err = store.get("uploads/../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::InvalidKey(_)));
        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_list_matches_name_prefix() {
        let (store, root) = temp_store();
        store
            .put("data/uploads.json", Bytes::from_static(b"[]"), "application/json")
            .await
            .unwrap();
        store
            .put(
                "data/uploads.json-abc123",
                Bytes::from_static(b"[1]"),
                "application/json",
            )
            .await
            .unwrap();
        store
            .put("data/other.json", Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();

        let matches = store.list("data/uploads.json").await.unwrap();
        let keys: Vec<&str> = matches.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["data/uploads.json", "data/uploads.json-abc123"]);

        let empty = store.list("missing-dir/none").await.unwrap();
        assert!(empty.is_empty());

        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_conditional_put_detects_concurrent_change() {
        let (store, root) = temp_store();

        let outcome = store
            .put_conditional("data/uploads.json", Bytes::from_static(b"[]"), "application/json", None)
            .await
            .unwrap();
        let original = match outcome {
            PutOutcome::Stored(meta) => meta,
            PutOutcome::Conflict => panic!("create-only write should land"),
        };

        // Another writer overwrites: the document grows, so the etag moves.
        store
            .put(
                "data/uploads.json",
                Bytes::from_static(b"[\"other\"]"),
                "application/json",
            )
            .await
            .unwrap();

        let outcome = store
            .put_conditional(
                "data/uploads.json",
                Bytes::from_static(b"[\"mine\"]"),
                "application/json",
                original.etag.clone(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Conflict);

        // Losing writer re-reads and retries with the fresh etag.
        let current = store.head("data/uploads.json").await.unwrap().unwrap();
        let outcome = store
            .put_conditional(
                "data/uploads.json",
                Bytes::from_static(b"[\"other\",\"mine\"]"),
                "application/json",
                current.etag.clone(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Stored(_)));

        let _ = fs::remove_dir_all(&root).await;
    }
}
