//! Seed tool that adds a photo to the upload index without going through
//! the HTTP API. Coordinates are taken verbatim, so photos outside NYC can
//! be injected for testing the map frontend.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use snapmap::blob_store::BlobStore;
use snapmap::config::{Config, StorageBackend};
use snapmap::fs_store::FsBlobStore;
use snapmap::ingest::{
    canonical_uploader, destination_name, mime_from_filename, new_record_id, PHOTO_PREFIX,
};
use snapmap::s3_store::S3BlobStore;
use snapmap::upload_index::{UploadIndex, UploadRecord};
use std::path::PathBuf;
use std::sync::Arc;

struct CliArgs {
    uploader: String,
    lat: f64,
    lng: f64,
    address: String,
    photo: PathBuf,
}

fn usage() -> ! {
    eprintln!(
        "Usage: add-upload --uploader <name> --photo <file> --lat <lat> --lng <lng> [--address <address>]"
    );
    std::process::exit(1);
}

fn require_coord(value: Option<String>, flag: &str) -> f64 {
    match value.as_deref().and_then(|v| v.trim().parse::<f64>().ok()) {
        Some(v) if v.is_finite() => v,
        _ => {
            eprintln!("{flag} must be a finite number");
            usage();
        }
    }
}

fn parse_args() -> CliArgs {
    let mut uploader = None;
    let mut lat = None;
    let mut lng = None;
    let mut address = None;
    let mut photo = None;

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--uploader" | "-u" => uploader = args.next(),
            "--lat" | "--latitude" => lat = args.next(),
            "--lng" | "--lon" | "--longitude" => lng = args.next(),
            "--address" | "-a" => address = args.next(),
            "--photo" | "--path" | "-p" => photo = args.next(),
            "--help" | "-h" => usage(),
            other => {
                eprintln!("Unknown argument: {other}");
                usage();
            }
        }
    }

    let Some(uploader) = uploader else {
        eprintln!("--uploader is required");
        usage();
    };
    let Some(photo) = photo else {
        eprintln!("--photo is required");
        usage();
    };

    CliArgs {
        uploader,
        lat: require_coord(lat, "--lat"),
        lng: require_coord(lng, "--lng"),
        address: address.unwrap_or_default(),
        photo: PathBuf::from(photo),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let store: Arc<dyn BlobStore> = match config.storage.backend {
        StorageBackend::S3 => Arc::new(
            S3BlobStore::new(&config.storage.s3)
                .await
                .context("Failed to initialize S3 blob store")?,
        ),
        StorageBackend::Filesystem => Arc::new(FsBlobStore::new(&config.storage.filesystem)),
    };
    let index = UploadIndex::new(store.clone(), &config.index);

    let bytes = std::fs::read(&args.photo)
        .with_context(|| format!("Failed to read {}", args.photo.display()))?;
    let file_name = args
        .photo
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(snapmap::multipart::DEFAULT_FILE_NAME);

    let now = Utc::now().trunc_subsecs(3);
    let millis = now.timestamp_millis();
    let key = format!("{}/{}", PHOTO_PREFIX, destination_name(millis, file_name));
    let meta = store
        .put(&key, Bytes::from(bytes), mime_from_filename(file_name))
        .await?;

    let record = UploadRecord {
        id: new_record_id(millis),
        uploader: canonical_uploader(&args.uploader),
        lat: args.lat,
        lng: args.lng,
        address: args.address,
        image: meta.url.clone(),
        original_path: args.photo.display().to_string(),
        created_at: now,
    };
    let total = index.append(record).await?;

    println!("Stored {} ({} bytes)", meta.url, meta.size_bytes);
    println!("Upload index now holds {total} records");

    Ok(())
}
