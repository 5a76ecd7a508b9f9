use anyhow::{Context, Result};
use snapmap::api::{start_api_server, AppState};
use snapmap::blob_store::BlobStore;
use snapmap::config::{Config, ServiceConfig, StorageBackend};
use snapmap::fs_store::FsBlobStore;
use snapmap::ingest::IngestionPipeline;
use snapmap::location::{LocationResolver, NominatimGeocoder};
use snapmap::s3_store::S3BlobStore;
use snapmap::upload_index::UploadIndex;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        backend = ?config.storage.backend,
        "Starting snapmap upload service"
    );

    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store: Arc<dyn BlobStore> = match config.storage.backend {
        StorageBackend::S3 => Arc::new(
            S3BlobStore::new(&config.storage.s3)
                .await
                .context("Failed to initialize S3 blob store")?,
        ),
        StorageBackend::Filesystem => Arc::new(FsBlobStore::new(&config.storage.filesystem)),
    };

    let geocoder = Arc::new(
        NominatimGeocoder::new(&config.geocoder).context("Failed to initialize geocoder")?,
    );
    let resolver = LocationResolver::new(geocoder);

    let index = Arc::new(UploadIndex::new(store.clone(), &config.index));

    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        resolver,
        index.clone(),
    ));

    // Create API state
    let api_state = AppState {
        pipeline,
        index,
        http: reqwest::Client::new(),
        blob_proxy_host: config.api.blob_proxy_host.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Upload service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down upload service");

    api_handle.abort();

    info!("Upload service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
