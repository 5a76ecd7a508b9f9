//! Upload ingestion pipeline.
//!
//! One entry point takes a raw multipart body and runs the whole
//! sequence: parse, validate, resolve location, store the photo, append
//! the index record. The photo is stored before the index is touched,
//! so a failed append can leave an orphaned photo but never a record
//! pointing at a missing one.

use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::location::{LocationError, LocationResolver};
use crate::multipart::{boundary_from_content_type, parse_form, DEFAULT_FILE_NAME};
use crate::upload_index::{IndexError, UploadIndex, UploadRecord};

/// Uploaders with a house style: any casing of these names is folded to
/// the capitalized form so the leaderboard counts them as one person.
pub const KNOWN_UPLOADERS: &[&str] = &["ben", "jake"];

/// Prefix under which photo blobs are stored.
pub const PHOTO_PREFIX: &str = "uploads";

/// Errors from the ingestion pipeline, grouped by who caused them.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The request was malformed; the message is safe to show the client.
    #[error("{0}")]
    BadRequest(String),
    /// A backend operation failed; the detail is for logs, not clients.
    #[error("Upload storage failed: {0}")]
    Storage(String),
    /// The index document exists but does not parse.
    #[error("Uploads data is corrupted: {0}")]
    Corrupted(String),
}

impl From<LocationError> for IngestError {
    fn from(e: LocationError) -> Self {
        IngestError::BadRequest(e.to_string())
    }
}

impl From<IndexError> for IngestError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Corrupted(detail) => IngestError::Corrupted(detail),
            other => IngestError::Storage(other.to_string()),
        }
    }
}

/// Orchestrates photo ingestion against a blob store and the upload index.
pub struct IngestionPipeline {
    store: Arc<dyn BlobStore>,
    resolver: LocationResolver,
    index: Arc<UploadIndex>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn BlobStore>,
        resolver: LocationResolver,
        index: Arc<UploadIndex>,
    ) -> Self {
        Self {
            store,
            resolver,
            index,
        }
    }

    /// Ingest one multipart upload body.
    #[instrument(skip(self, body, content_type), fields(size_bytes = body.len()))]
    pub async fn ingest(
        &self,
        body: &[u8],
        content_type: &str,
    ) -> Result<UploadRecord, IngestError> {
        let boundary = boundary_from_content_type(content_type)
            .ok_or_else(|| IngestError::BadRequest("Missing multipart boundary".to_string()))?;
        let form = parse_form(body, &format!("--{}", boundary));

        let uploader_field = form.field("uploader").unwrap_or_default();
        let file_content = match form.file_content {
            Some(ref content) if !uploader_field.is_empty() => content.clone(),
            _ => {
                return Err(IngestError::BadRequest(
                    "Missing uploader or file".to_string(),
                ))
            }
        };

        let uploader = canonical_uploader(uploader_field);
        let address = form.field("address").unwrap_or_default();
        let location = self
            .resolver
            .resolve(form.field("lat"), form.field("lng"), address)
            .await?;

        let file_name = form
            .file_name
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        // Truncated to millisecond precision, which is what the index
        // document stores; the returned record round-trips exactly.
        let now = Utc::now().trunc_subsecs(3);
        let key = format!(
            "{}/{}",
            PHOTO_PREFIX,
            destination_name(now.timestamp_millis(), &file_name)
        );

        let stored = self
            .store
            .put(&key, Bytes::from(file_content), mime_from_filename(&file_name))
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;
        metrics::counter!("snapmap.uploads.bytes_stored").increment(stored.size_bytes);

        let record = UploadRecord {
            id: new_record_id(now.timestamp_millis()),
            uploader,
            lat: location.lat,
            lng: location.lng,
            address: location.address,
            image: stored.url,
            original_path: format!("(browser-uploaded) {}", file_name),
            created_at: now,
        };

        let total = self.index.append(record.clone()).await?;
        metrics::counter!("snapmap.uploads.stored").increment(1);

        info!(
            record_id = %record.id,
            uploader = %record.uploader,
            image = %record.image,
            total,
            "Upload ingested"
        );

        Ok(record)
    }
}

/// Fold known uploader names to their canonical capitalized form;
/// unknown names pass through trimmed.
pub fn canonical_uploader(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_lowercase();
    if KNOWN_UPLOADERS.contains(&lower.as_str()) {
        let mut chars = lower.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => lower,
        }
    } else {
        trimmed.to_string()
    }
}

/// Destination file name for a stored photo: epoch millis plus the
/// original name with whitespace runs and path separators collapsed to
/// single underscores.
pub fn destination_name(millis: i64, original: &str) -> String {
    format!("{}_{}", millis, sanitize_file_name(original))
}

fn sanitize_file_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut previous_collapsed = false;
    for c in name.chars() {
        let collapse = c.is_whitespace() || c == '/' || c == '\\';
        if collapse {
            if !previous_collapsed {
                sanitized.push('_');
            }
        } else {
            sanitized.push(c);
        }
        previous_collapsed = collapse;
    }
    sanitized
}

/// Content type inferred from a file name's extension.
pub fn mime_from_filename(name: &str) -> &'static str {
    let ext = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "html" => "text/html",
        "js" => "application/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        _ => "application/octet-stream",
    }
}

/// Record ID: epoch millis plus a short random suffix, unique enough for
/// a human-scale photo map.
pub fn new_record_id(millis: i64) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", millis, &uuid[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStoreError, MemoryBlobStore, MockBlobStore};
    use crate::config::IndexConfig;
    use crate::location::{GeocodeHit, MockGeocodeClient};

    const BOUNDARY: &str = "form-boundary";

    struct BodyBuilder {
        body: Vec<u8>,
    }

    impl BodyBuilder {
        fn new() -> Self {
            Self { body: Vec::new() }
        }

        fn field(mut self, name: &str, value: &str) -> Self {
            self.body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
            self
        }

        fn file(mut self, file_name: &str, content: &[u8]) -> Self {
            self.body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"{file_name}\"\r\n\r\n"
                )
                .as_bytes(),
            );
            self.body.extend_from_slice(content);
            self.body.extend_from_slice(b"\r\n");
            self
        }

        fn build(mut self) -> Vec<u8> {
            self.body
                .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
            self.body
        }
    }

    fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    fn index_config(conditional_writes: bool) -> IndexConfig {
        IndexConfig {
            key: "data/uploads.json".to_string(),
            conditional_writes,
            max_write_retries: 3,
        }
    }

    fn pipeline_with(
        store: Arc<dyn BlobStore>,
        geocoder: MockGeocodeClient,
        conditional_writes: bool,
    ) -> IngestionPipeline {
        let resolver = LocationResolver::new(Arc::new(geocoder));
        let index = Arc::new(UploadIndex::new(store.clone(), &index_config(conditional_writes)));
        IngestionPipeline::new(store, resolver, index)
    }

    #[test]
    fn test_canonical_uploader() {
        assert_eq!(canonical_uploader("ben"), "Ben");
        assert_eq!(canonical_uploader("BEN"), "Ben");
        assert_eq!(canonical_uploader(" jAkE "), "Jake");
        assert_eq!(canonical_uploader("Alice "), "Alice");
        assert_eq!(canonical_uploader(""), "");
    }

    #[test]
    fn test_destination_name_sanitizes() {
        assert_eq!(
            destination_name(1700000000000, "my cat  pic.jpg"),
            "1700000000000_my_cat_pic.jpg"
        );
        assert_eq!(
            destination_name(1700000000000, "tab\tand newline\n.png"),
            "1700000000000_tab_and_newline_.png"
        );
        assert_eq!(
            destination_name(1700000000000, "../escape/attempt.jpg"),
            "1700000000000_.._escape_attempt.jpg"
        );
    }

    #[test]
    fn test_mime_from_filename() {
        assert_eq!(mime_from_filename("photo.jpg"), "image/jpeg");
        assert_eq!(mime_from_filename("photo.JPEG"), "image/jpeg");
        assert_eq!(mime_from_filename("pic.HEIC"), "image/heic");
        assert_eq!(mime_from_filename("anim.webp"), "image/webp");
        assert_eq!(mime_from_filename("noextension"), "application/octet-stream");
        assert_eq!(mime_from_filename("weird.xyz"), "application/octet-stream");
    }

    #[test]
    fn test_new_record_id_shape() {
        let id = new_record_id(1700000000000);
        let (millis, suffix) = id.split_once('-').unwrap();
        assert_eq!(millis, "1700000000000");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_ingest_with_explicit_coordinates() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut geocoder = MockGeocodeClient::new();
        geocoder.expect_geocode().times(0);
        let pipeline = pipeline_with(store.clone(), geocoder, false);

        let body = BodyBuilder::new()
            .field("uploader", "ben")
            .field("lat", "40.7031")
            .field("lng", "-74.017")
            .file("cat pic.jpg", b"\xff\xd8\xff jpeg")
            .build();

        let record = pipeline.ingest(&body, &content_type()).await.unwrap();

        assert_eq!(record.uploader, "Ben");
        assert_eq!(record.lat, 40.7031);
        assert_eq!(record.lng, -74.017);
        assert_eq!(record.address, "");
        assert_eq!(record.original_path, "(browser-uploaded) cat pic.jpg");
        assert!(record.image.starts_with("memory://uploads/"));
        assert!(record.image.ends_with("_cat_pic.jpg"));

        // The photo landed under the uploads prefix.
        let photos = store.list("uploads/").await.unwrap();
        assert_eq!(photos.len(), 1);
        let bytes = store.get(&photos[0].key).await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), b"\xff\xd8\xff jpeg");

        // And exactly one index record exists.
        let index_doc = store.get("data/uploads.json").await.unwrap().unwrap();
        let records: Vec<UploadRecord> = serde_json::from_slice(&index_doc).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], record);
    }

    #[tokio::test]
    async fn test_ingest_geocodes_address() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut geocoder = MockGeocodeClient::new();
        geocoder
            .expect_geocode()
            .withf(|address| address == "350 5th Ave, New York City, NY")
            .times(1)
            .returning(|_| {
                Ok(GeocodeHit {
                    lat: 40.7484,
                    lng: -73.9857,
                })
            });
        let pipeline = pipeline_with(store, geocoder, false);

        let body = BodyBuilder::new()
            .field("uploader", "jake")
            .field("address", "350 5th Ave")
            .file("empire.png", b"png-bytes")
            .build();

        let record = pipeline.ingest(&body, &content_type()).await.unwrap();
        assert_eq!(record.uploader, "Jake");
        assert_eq!(record.lat, 40.7484);
        assert_eq!(record.address, "350 5th Ave, New York City, NY");
    }

    #[tokio::test]
    async fn test_ingest_rejects_non_multipart_content_type() {
        let store = Arc::new(MemoryBlobStore::new());
        let pipeline = pipeline_with(store, MockGeocodeClient::new(), false);

        let err = pipeline
            .ingest(b"{}", "application/json")
            .await
            .unwrap_err();
        match err {
            IngestError::BadRequest(message) => {
                assert_eq!(message, "Missing multipart boundary")
            }
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingest_requires_uploader_and_file() {
        let store = Arc::new(MemoryBlobStore::new());
        let pipeline = pipeline_with(store, MockGeocodeClient::new(), false);

        // File without uploader.
        let body = BodyBuilder::new().file("cat.jpg", b"bytes").build();
        let err = pipeline.ingest(&body, &content_type()).await.unwrap_err();
        assert!(matches!(err, IngestError::BadRequest(ref m) if m == "Missing uploader or file"));

        // Uploader without file.
        let body = BodyBuilder::new()
            .field("uploader", "ben")
            .field("lat", "40.7")
            .field("lng", "-74.0")
            .build();
        let err = pipeline.ingest(&body, &content_type()).await.unwrap_err();
        assert!(matches!(err, IngestError::BadRequest(ref m) if m == "Missing uploader or file"));
    }

    #[tokio::test]
    async fn test_ingest_maps_geocode_failure_to_bad_request() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut geocoder = MockGeocodeClient::new();
        geocoder
            .expect_geocode()
            .times(1)
            .returning(|_| Err(LocationError::NoResults));
        let pipeline = pipeline_with(store.clone(), geocoder, false);

        let body = BodyBuilder::new()
            .field("uploader", "ben")
            .field("address", "does not exist anywhere")
            .file("cat.jpg", b"bytes")
            .build();

        let err = pipeline.ingest(&body, &content_type()).await.unwrap_err();
        assert!(matches!(err, IngestError::BadRequest(ref m) if m == "No results for that address"));

        // Nothing was stored.
        assert!(store.list("uploads/").await.unwrap().is_empty());
        assert!(store.get("data/uploads.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_photo_store_failure_leaves_index_untouched() {
        let mut store = MockBlobStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_, _, _| Err(BlobStoreError::Write("disk full".to_string())));
        // No head/get/list/put_conditional expectations: any index access
        // would fail the test.
        let mut geocoder = MockGeocodeClient::new();
        geocoder.expect_geocode().times(0);
        let pipeline = pipeline_with(Arc::new(store), geocoder, false);

        let body = BodyBuilder::new()
            .field("uploader", "ben")
            .field("lat", "40.7")
            .field("lng", "-74.0")
            .file("cat.jpg", b"bytes")
            .build();

        let err = pipeline.ingest(&body, &content_type()).await.unwrap_err();
        assert!(matches!(err, IngestError::Storage(_)));
    }

    #[tokio::test]
    async fn test_concurrent_ingests_last_writer_wins_mode() {
        let store = Arc::new(MemoryBlobStore::new());

        let make_pipeline = |store: Arc<MemoryBlobStore>| {
            let mut geocoder = MockGeocodeClient::new();
            geocoder.expect_geocode().times(0);
            Arc::new(pipeline_with(store, geocoder, false))
        };
        let pipeline_a = make_pipeline(store.clone());
        let pipeline_b = make_pipeline(store.clone());

        let body_a = BodyBuilder::new()
            .field("uploader", "ben")
            .field("lat", "40.70")
            .field("lng", "-74.00")
            .file("a.jpg", b"aaa")
            .build();
        let body_b = BodyBuilder::new()
            .field("uploader", "jake")
            .field("lat", "40.71")
            .field("lng", "-74.01")
            .file("b.jpg", b"bbb")
            .build();

        let ct = content_type();
        let (a, b) = tokio::join!(
            pipeline_a.ingest(&body_a, &ct),
            pipeline_b.ingest(&body_b, &ct)
        );
        a.unwrap();
        b.unwrap();

        // Read-modify-write without preconditions: both requests succeed,
        // but an interleaved pair may persist only the later write.
        let index_doc = store.get("data/uploads.json").await.unwrap().unwrap();
        let records: Vec<UploadRecord> = serde_json::from_slice(&index_doc).unwrap();
        assert!((1..=2).contains(&records.len()));
    }

    #[tokio::test]
    async fn test_concurrent_ingests_conditional_mode_keeps_both() {
        let store = Arc::new(MemoryBlobStore::new());

        let make_pipeline = |store: Arc<MemoryBlobStore>| {
            let mut geocoder = MockGeocodeClient::new();
            geocoder.expect_geocode().times(0);
            Arc::new(pipeline_with(store, geocoder, true))
        };
        let pipeline_a = make_pipeline(store.clone());
        let pipeline_b = make_pipeline(store.clone());

        let body_a = BodyBuilder::new()
            .field("uploader", "ben")
            .field("lat", "40.70")
            .field("lng", "-74.00")
            .file("a.jpg", b"aaa")
            .build();
        let body_b = BodyBuilder::new()
            .field("uploader", "jake")
            .field("lat", "40.71")
            .field("lng", "-74.01")
            .file("b.jpg", b"bbb")
            .build();

        let ct = content_type();
        let handle_a = {
            let pipeline = pipeline_a.clone();
            let body = body_a.clone();
            let ct = ct.clone();
            tokio::spawn(async move { pipeline.ingest(&body, &ct).await })
        };
        let handle_b = {
            let pipeline = pipeline_b.clone();
            let body = body_b.clone();
            let ct = ct.clone();
            tokio::spawn(async move { pipeline.ingest(&body, &ct).await })
        };

        handle_a.await.unwrap().unwrap();
        handle_b.await.unwrap().unwrap();

        let index_doc = store.get("data/uploads.json").await.unwrap().unwrap();
        let records: Vec<UploadRecord> = serde_json::from_slice(&index_doc).unwrap();
        assert_eq!(records.len(), 2);
    }
}
