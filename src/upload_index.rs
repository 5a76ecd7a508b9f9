//! The shared upload index.
//!
//! All upload records live in a single JSON array stored as one blob
//! (`data/uploads.json` by default). Loads resolve the canonical key
//! first and fall back to a prefix scan that recovers documents written
//! under randomized-suffix keys by earlier deployments. Appends follow
//! the configured write mode: plain read-modify-write, or conditional
//! writes keyed on the blob's etag with bounded retries.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::blob_store::{BlobStore, BlobStoreError, PutOutcome};
use crate::config::IndexConfig;

/// Errors surfaced by index operations.
///
/// A corrupted document is deliberately distinct from a read failure:
/// both are hard errors, but corruption means the stored JSON itself is
/// bad and writing "fresh" state over it would destroy history.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Failed to read upload index: {0}")]
    Read(String),
    #[error("Upload index is corrupted: {0}")]
    Corrupted(String),
    #[error("Failed to write upload index: {0}")]
    Write(String),
    #[error("Upload index write conflict persisted after {0} retries")]
    Contention(u32),
}

impl From<BlobStoreError> for IndexError {
    fn from(e: BlobStoreError) -> Self {
        match e {
            BlobStoreError::Write(_) | BlobStoreError::InvalidKey(_) => {
                IndexError::Write(e.to_string())
            }
            BlobStoreError::Read(_) | BlobStoreError::List(_) => IndexError::Read(e.to_string()),
        }
    }
}

/// One upload, as stored in the index and returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    /// Record ID: epoch millis plus a short random suffix.
    pub id: String,
    /// Canonical uploader name.
    pub uploader: String,
    /// Latitude on the map.
    pub lat: f64,
    /// Longitude on the map.
    pub lng: f64,
    /// Address recorded with the upload; may be empty when explicit
    /// coordinates were supplied.
    pub address: String,
    /// Public URL of the stored photo.
    pub image: String,
    /// Provenance of the photo: original file name or source path.
    pub original_path: String,
    /// When the record was persisted.
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
}

/// ISO-8601 timestamps with millisecond precision, as the index has
/// always stored them.
mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Append-only upload index over a blob store.
pub struct UploadIndex {
    store: Arc<dyn BlobStore>,
    key: String,
    conditional_writes: bool,
    max_write_retries: u32,
}

impl UploadIndex {
    pub fn new(store: Arc<dyn BlobStore>, config: &IndexConfig) -> Self {
        Self {
            store,
            key: config.key.clone(),
            conditional_writes: config.conditional_writes,
            max_write_retries: config.max_write_retries,
        }
    }

    /// Load every record in the index.
    pub async fn load(&self) -> Result<Vec<UploadRecord>, IndexError> {
        let (records, _) = self.load_versioned().await?;
        Ok(records)
    }

    /// Load the index together with the canonical blob's version token.
    ///
    /// The token is `None` when the canonical key does not exist. That
    /// includes documents recovered from a legacy suffixed key, since a
    /// conditional save must then create the canonical blob, not
    /// replace one.
    pub async fn load_versioned(
        &self,
    ) -> Result<(Vec<UploadRecord>, Option<String>), IndexError> {
        if let Some(meta) = self.store.head(&self.key).await? {
            let bytes = self
                .store
                .get(&self.key)
                .await?
                .ok_or_else(|| IndexError::Read("index blob vanished during read".to_string()))?;
            let records = parse_index(&bytes)?;
            return Ok((records, meta.etag));
        }

        // The canonical key is absent. Older deployments wrote the index
        // under randomized suffixes, so scan the prefix and take the most
        // recently written candidate before concluding the index is empty.
        let candidates = self.store.list(&self.key).await?;
        let newest = candidates.into_iter().max_by_key(|m| m.uploaded_at);

        if let Some(newest) = newest {
            warn!(
                recovered_from = %newest.key,
                "Canonical index missing; recovered legacy document"
            );
            let bytes = self
                .store
                .get(&newest.key)
                .await?
                .ok_or_else(|| IndexError::Read("index blob vanished during read".to_string()))?;
            let records = parse_index(&bytes)?;
            return Ok((records, None));
        }

        debug!("No index document found; starting empty");
        Ok((Vec::new(), None))
    }

    /// Overwrite the index with the given records.
    pub async fn save(&self, records: &[UploadRecord]) -> Result<(), IndexError> {
        let bytes = render_index(records)?;
        self.store
            .put(&self.key, Bytes::from(bytes), "application/json")
            .await?;
        Ok(())
    }

    /// Append one record, returning the resulting record count.
    ///
    /// With conditional writes disabled this is a plain read-modify-write
    /// and a concurrent append can be lost to the last writer. With them
    /// enabled, a write that loses the race re-reads the index and
    /// reapplies the record, up to the configured retry bound.
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn append(&self, record: UploadRecord) -> Result<usize, IndexError> {
        if !self.conditional_writes {
            let (mut records, _) = self.load_versioned().await?;
            records.push(record);
            self.save(&records).await?;
            debug!(total = records.len(), "Index updated");
            return Ok(records.len());
        }

        let mut conflicts = 0u32;
        loop {
            let (mut records, etag) = self.load_versioned().await?;
            records.push(record.clone());
            let bytes = render_index(&records)?;

            let outcome = self
                .store
                .put_conditional(&self.key, Bytes::from(bytes), "application/json", etag)
                .await?;

            match outcome {
                PutOutcome::Stored(_) => {
                    debug!(total = records.len(), "Index updated");
                    return Ok(records.len());
                }
                PutOutcome::Conflict => {
                    conflicts += 1;
                    metrics::counter!("snapmap.index.write_conflicts").increment(1);
                    if conflicts > self.max_write_retries {
                        return Err(IndexError::Contention(self.max_write_retries));
                    }
                    warn!(attempt = conflicts, "Index write conflict; retrying");
                }
            }
        }
    }
}

fn parse_index(bytes: &[u8]) -> Result<Vec<UploadRecord>, IndexError> {
    // An empty document reads as an empty index.
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(bytes).map_err(|e| IndexError::Corrupted(e.to_string()))
}

fn render_index(records: &[UploadRecord]) -> Result<Vec<u8>, IndexError> {
    serde_json::to_vec_pretty(records).map_err(|e| IndexError::Write(e.to_string()))
}
