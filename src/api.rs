//! HTTP API for uploads.
//!
//! `POST /api/upload` takes the raw multipart body plus its
//! `Content-Type` header and hands both to the ingestion pipeline; no
//! framework multipart extractor sits in between, so the pipeline's
//! byte-level parsing contract is the only one in play. `GET
//! /api/uploads` returns the full index. `GET /api/blob-image` proxies
//! allow-listed blob URLs for pages that cannot fetch the store
//! cross-origin.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use crate::config::ApiConfig;
use crate::ingest::{IngestError, IngestionPipeline};
use crate::upload_index::{IndexError, UploadIndex, UploadRecord};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub index: Arc<UploadIndex>,
    pub http: reqwest::Client,
    /// Host marker a proxied blob URL must contain; `None` disables the
    /// blob-image proxy.
    pub blob_proxy_host: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Query parameters for the blob-image proxy
#[derive(Debug, Deserialize)]
pub struct BlobImageQuery {
    /// Full https URL of the blob to fetch.
    pub url: Option<String>,
    /// Short alias accepted for older pages.
    pub u: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/upload", post(upload_photo))
        .route("/api/uploads", get(list_uploads))
        .route("/api/blob-image", get(blob_image))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "snapmap"
    }))
}

/// Ingest one photo upload
#[instrument(skip(state, headers, body), fields(size_bytes = body.len()))]
async fn upload_photo(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadRecord>, (StatusCode, Json<ErrorResponse>)> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let record = state
        .pipeline
        .ingest(&body, content_type)
        .await
        .map_err(|e| {
            metrics::counter!("snapmap.uploads.failed").increment(1);
            ingest_error_response(e)
        })?;

    Ok(Json(record))
}

/// Return every upload record in the index
#[instrument(skip(state))]
async fn list_uploads(
    State(state): State<AppState>,
) -> Result<Json<Vec<UploadRecord>>, (StatusCode, Json<ErrorResponse>)> {
    let records = state.index.load().await.map_err(|e| {
        error!(error = %e, "Failed to load uploads");
        match e {
            IndexError::Corrupted(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Uploads data is corrupted".to_string(),
                    code: "INDEX_CORRUPTED".to_string(),
                }),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to load uploads".to_string(),
                    code: "READ_ERROR".to_string(),
                }),
            ),
        }
    })?;

    Ok(Json(records))
}

/// Proxy an allow-listed blob URL
#[instrument(skip(state, params))]
async fn blob_image(State(state): State<AppState>, Query(params): Query<BlobImageQuery>) -> Response {
    let Some(target) = params.url.or(params.u) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing url", "MISSING_URL")
            .into_response();
    };

    if !is_allowed_blob_url(&target, state.blob_proxy_host.as_deref()) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid blob url", "INVALID_URL")
            .into_response();
    }

    let upstream = match state.http.get(&target).send().await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Blob proxy fetch failed");
            return error_response(StatusCode::BAD_GATEWAY, "Blob fetch failed", "UPSTREAM_ERROR")
                .into_response();
        }
    };

    if !upstream.status().is_success() {
        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        return error_response(status, "Blob fetch failed", "UPSTREAM_ERROR").into_response();
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Blob proxy body read failed");
            return error_response(StatusCode::BAD_GATEWAY, "Blob fetch failed", "UPSTREAM_ERROR")
                .into_response();
        }
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=3600".to_string()),
        ],
        bytes,
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Map pipeline errors to HTTP responses. Client errors carry their
/// message through; backend failures return a generic message with the
/// detail kept in logs.
fn ingest_error_response(err: IngestError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        IngestError::BadRequest(message) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: message,
                code: "BAD_REQUEST".to_string(),
            }),
        ),
        IngestError::Storage(detail) => {
            error!(detail = %detail, "Upload failed in the storage layer");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Upload storage failed".to_string(),
                    code: "STORAGE_ERROR".to_string(),
                }),
            )
        }
        IngestError::Corrupted(detail) => {
            error!(detail = %detail, "Upload index is corrupted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Uploads data is corrupted".to_string(),
                    code: "INDEX_CORRUPTED".to_string(),
                }),
            )
        }
    }
}

fn is_allowed_blob_url(url: &str, allowed_host_marker: Option<&str>) -> bool {
    let Some(marker) = allowed_host_marker else {
        return false;
    };
    url.starts_with("https://") && url.contains(marker)
}

/// Start the upload API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
