use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the upload service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Blob storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Geocoder configuration
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    /// Upload index configuration
    #[serde(default)]
    pub index: IndexConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// API configuration for the upload endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Host marker required in URLs served by the blob-image proxy;
    /// unset disables the proxy
    pub blob_proxy_host: Option<String>,
}

/// Which blob store backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    S3,
    #[default]
    Filesystem,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackend,
    /// S3 backend settings
    #[serde(default)]
    pub s3: S3Config,
    /// Filesystem backend settings
    #[serde(default)]
    pub filesystem: FilesystemConfig,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for photos and the upload index
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL recorded in upload records; defaults to the
    /// bucket's virtual-hosted AWS endpoint
    pub public_base_url: Option<String>,
}

/// Filesystem storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    /// Root directory holding `uploads/` and `data/`
    #[serde(default = "default_fs_root")]
    pub root: PathBuf,
}

/// Geocoder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GeocoderConfig {
    /// Nominatim-compatible search endpoint
    #[serde(default = "default_geocoder_base_url")]
    pub base_url: String,
    /// User-Agent sent with geocoding requests (required by Nominatim's
    /// usage policy)
    #[serde(default = "default_geocoder_user_agent")]
    pub user_agent: String,
    /// Request timeout in seconds
    #[serde(default = "default_geocoder_timeout_secs")]
    pub timeout_secs: u64,
}

/// Upload index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Blob key of the canonical index document
    #[serde(default = "default_index_key")]
    pub key: String,
    /// Use conditional writes so concurrent appends are never lost;
    /// disable for plain last-writer-wins read-modify-write
    #[serde(default = "default_true")]
    pub conditional_writes: bool,
    /// How many times a losing conditional write re-reads and retries
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
}

// Default value functions
fn default_service_name() -> String {
    "snapmap".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    15 * 1024 * 1024 // phone photos, with headroom
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_fs_root() -> PathBuf {
    PathBuf::from("public")
}

fn default_geocoder_base_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

fn default_geocoder_user_agent() -> String {
    "snapmap/1.0".to_string()
}

fn default_geocoder_timeout_secs() -> u64 {
    10
}

fn default_index_key() -> String {
    "data/uploads.json".to_string()
}

fn default_max_write_retries() -> u32 {
    3
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "snapmap")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/snapmap").required(false))
            .add_source(config::File::with_name("/etc/snapmap/config").required(false))
            // Override with environment variables
            // SNAPMAP__STORAGE__S3__BUCKET -> storage.s3.bucket
            .add_source(
                config::Environment::with_prefix("SNAPMAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Check cross-field requirements the serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.backend == StorageBackend::S3 && self.storage.s3.bucket.is_empty() {
            return Err(ConfigError::MissingRequired(
                "storage.s3.bucket (required for the s3 backend)".to_string(),
            ));
        }

        if self.geocoder.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "geocoder.timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.index.key.is_empty() {
            return Err(ConfigError::MissingRequired("index.key".to_string()));
        }

        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
            blob_proxy_host: None,
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
        }
    }
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root: default_fs_root(),
        }
    }
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoder_base_url(),
            user_agent: default_geocoder_user_agent(),
            timeout_secs: default_geocoder_timeout_secs(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            key: default_index_key(),
            conditional_writes: default_true(),
            max_write_retries: default_max_write_retries(),
        }
    }
}
