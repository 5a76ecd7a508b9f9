//! Snapmap Upload Service
//!
//! Ingestion service for the snapmap NYC photo map. Accepts multipart photo
//! uploads over HTTP, resolves each photo to coordinates inside New York City
//! (trusting explicit coordinates, geocoding street addresses otherwise),
//! stores the photo bytes in a blob store, and appends a record to a single
//! JSON upload index the map frontend reads.
//!
//! ## Features
//!
//! - **Hand-rolled Multipart Parsing**: Byte-exact `multipart/form-data`
//!   handling that preserves binary photo payloads untouched
//! - **NYC Location Resolution**: Explicit coordinates pass through; street
//!   addresses are normalized, geocoded via Nominatim, and gated to the NYC
//!   bounding box
//! - **Append-only Upload Index**: One JSON document in the blob store, read
//!   with canonical-then-legacy fallback and written last-writer-wins or via
//!   conditional writes with bounded retries
//! - **Pluggable Blob Storage**: S3 for deployment, local filesystem for
//!   development, in-memory for tests
//!
//! ## Architecture
//!
//! ```text
//! HTTP Clients                Blob Store
//! ┌──────────────┐           ┌─────────────────────┐
//! │ POST         │           │ uploads/            │
//! │ /api/upload  │──────────▶│   {ts}_{name}.jpg   │
//! └──────────────┘           │ data/               │
//!        │                   │   uploads.json      │
//!        │                   └─────────────────────┘
//!        ▼                          ▲
//! ┌──────────────┐                  │
//! │ Multipart    │                  │
//! │ Parser       │                  │
//! └──────────────┘                  │
//!        │                          │
//!        ▼                          │
//! ┌──────────────┐           ┌──────────────┐
//! │ Location     │           │ Upload       │
//! │ Resolver     │──────────▶│ Index        │
//! └──────────────┘           └──────────────┘
//!        │                          ▲
//!        ▼                          │
//! ┌──────────────┐           ┌──────────────┐
//! │ Nominatim    │           │ GET          │
//! │ Geocoder     │           │ /api/uploads │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod config;
pub mod fs_store;
pub mod ingest;
pub mod location;
pub mod multipart;
pub mod s3_store;
pub mod upload_index;

pub use api::AppState;
pub use blob_store::{BlobMeta, BlobStore, MemoryBlobStore, PutOutcome};
pub use config::Config;
pub use fs_store::FsBlobStore;
pub use ingest::{IngestError, IngestionPipeline};
pub use location::{GeocodeClient, LocationResolver, NominatimGeocoder, ResolvedLocation};
pub use multipart::{boundary_from_content_type, parse_form, ParsedForm};
pub use s3_store::S3BlobStore;
pub use upload_index::{UploadIndex, UploadRecord};
