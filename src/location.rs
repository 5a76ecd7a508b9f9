//! Location resolution for incoming uploads.
//!
//! Uploads carry either explicit coordinates or a free-text address.
//! Explicit finite coordinates are trusted as-is; addresses are
//! normalized with a New York City anchor and forward-geocoded through
//! Nominatim, then sanity-checked against the NYC bounding box so a
//! globally ambiguous address ("Springfield") cannot pin a photo to the
//! wrong continent.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::GeocoderConfig;

/// NYC bounding box used to reject geocode results outside the service
/// area. Coordinates are inclusive on both ends.
pub const NYC_LAT_RANGE: (f64, f64) = (40.4774, 40.9176);
pub const NYC_LNG_RANGE: (f64, f64) = (-74.2591, -73.7004);

/// Errors surfaced while resolving an upload's location.
///
/// Every variant maps to a client error at the HTTP boundary; the
/// messages are the user-facing text.
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("Missing address")]
    MissingAddress,
    #[error("Geocoding failed: {0}")]
    Upstream(String),
    #[error("Geocoding timed out")]
    Timeout,
    #[error("No results for that address")]
    NoResults,
    #[error("Invalid geocode result")]
    InvalidResult,
    #[error("Address appears outside NYC")]
    OutsideServiceArea,
}

/// Raw coordinates returned by a geocoder, before the service-area gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeocodeHit {
    pub lat: f64,
    pub lng: f64,
}

/// Forward geocoder seam.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeocodeClient: Send + Sync {
    /// Geocode a free-text address to coordinates.
    async fn geocode(&self, address: &str) -> Result<GeocodeHit, LocationError>;
}

/// Nominatim search response entry. Coordinates arrive as strings.
#[derive(Debug, Deserialize)]
struct NominatimHit {
    #[serde(default)]
    lat: String,
    #[serde(default)]
    lon: String,
}

/// Geocoder backed by the Nominatim search API.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    /// Build a geocoder from configuration.
    ///
    /// Nominatim's usage policy requires an identifying User-Agent, so
    /// the configured agent is applied to every request alongside the
    /// request timeout.
    pub fn new(config: &GeocoderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeocodeClient for NominatimGeocoder {
    #[instrument(skip(self))]
    async fn geocode(&self, address: &str) -> Result<GeocodeHit, LocationError> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("format", "json"), ("limit", "1"), ("q", address)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LocationError::Timeout
                } else {
                    LocationError::Upstream(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(LocationError::Upstream(format!(
                "status {}",
                response.status()
            )));
        }

        let hits: Vec<NominatimHit> = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LocationError::Timeout
            } else {
                LocationError::NoResults
            }
        })?;

        let first = hits.into_iter().next().ok_or(LocationError::NoResults)?;
        let lat = parse_finite(&first.lat);
        let lng = parse_finite(&first.lon);

        match (lat, lng) {
            (Some(lat), Some(lng)) => {
                debug!(lat, lng, "Geocoded address");
                Ok(GeocodeHit { lat, lng })
            }
            _ => Err(LocationError::InvalidResult),
        }
    }
}

/// Where an upload ended up on the map, plus the address recorded with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub lat: f64,
    pub lng: f64,
    /// Normalized address for geocoded uploads; the caller-supplied
    /// address (possibly empty) when explicit coordinates were given.
    pub address: String,
}

/// Resolves upload locations from explicit coordinates or addresses.
pub struct LocationResolver {
    geocoder: Arc<dyn GeocodeClient>,
}

impl LocationResolver {
    pub fn new(geocoder: Arc<dyn GeocodeClient>) -> Self {
        Self { geocoder }
    }

    /// Resolve an upload's location.
    ///
    /// When both `lat` and `lng` parse as finite numbers they are
    /// trusted without a service-area check and the geocoder is never
    /// consulted. Otherwise the address is required, normalized, and
    /// geocoded, and the result must fall inside the NYC bounding box.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        lat: Option<&str>,
        lng: Option<&str>,
        address: &str,
    ) -> Result<ResolvedLocation, LocationError> {
        let explicit_lat = lat.and_then(parse_finite);
        let explicit_lng = lng.and_then(parse_finite);

        if let (Some(lat), Some(lng)) = (explicit_lat, explicit_lng) {
            debug!(lat, lng, "Using explicit coordinates");
            return Ok(ResolvedLocation {
                lat,
                lng,
                address: address.to_string(),
            });
        }

        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(LocationError::MissingAddress);
        }

        let normalized = normalize_address(trimmed);
        let hit = self.geocoder.geocode(&normalized).await.map_err(|e| {
            metrics::counter!("snapmap.geocode.failures").increment(1);
            e
        })?;

        if !within_service_area(hit.lat, hit.lng) {
            warn!(
                lat = hit.lat,
                lng = hit.lng,
                address = %normalized,
                "Geocode result outside service area"
            );
            return Err(LocationError::OutsideServiceArea);
        }

        Ok(ResolvedLocation {
            lat: hit.lat,
            lng: hit.lng,
            address: normalized,
        })
    }
}

/// Anchor a bare address to New York City.
///
/// Addresses that already mention the city (any casing of "ny" or
/// "new york") pass through untouched; anything else gets the
/// ", New York City, NY" suffix so street-level queries resolve inside
/// the service area.
pub fn normalize_address(address: &str) -> String {
    let lower = address.to_lowercase();
    if lower.contains("ny") || lower.contains("new york") {
        address.to_string()
    } else {
        format!("{}, New York City, NY", address)
    }
}

/// Whether coordinates fall inside the NYC service area.
pub fn within_service_area(lat: f64, lng: f64) -> bool {
    lat >= NYC_LAT_RANGE.0
        && lat <= NYC_LAT_RANGE.1
        && lng >= NYC_LNG_RANGE.0
        && lng <= NYC_LNG_RANGE.1
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
