//! Reverse geocoding abstraction
//!
//! - `ReverseGeocoder` is the provider seam (Nominatim in production, fakes in tests)
//! - `RateLimitedNominatimGeocoder` spaces provider calls per Nominatim's usage policy
//! - `CachedReverseGeocoder` memoizes results by rounded coordinates
//!
//! Nothing in this module retries. A failed lookup is left for the backlog
//! crawler to pick up again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::services::geocode_cache::{cache_key, GeocodeCache};
use crate::services::nominatim::NominatimClient;
use crate::types::{AddressEnvelope, Coordinates};

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("geocoding service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("geocoding service error: {0}")]
    Provider(String),

    #[error("unreadable geocoding response: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse_geocode(&self, point: Coordinates) -> Result<AddressEnvelope, GeocodeError>;

    fn name(&self) -> &'static str;
}

// ==========================================================================
// RateLimiter
// ==========================================================================

/// Enforces a minimum interval between calls
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_interval,
        }
    }

    /// Wait until the next call is allowed.
    ///
    /// The lock is held across the sleep so concurrent callers queue up
    /// behind each other instead of firing together.
    pub async fn wait(&self) {
        let mut last = self.last_call.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

// ==========================================================================
// RateLimitedNominatimGeocoder
// ==========================================================================

pub struct RateLimitedNominatimGeocoder {
    client: NominatimClient,
    rate_limiter: RateLimiter,
}

impl RateLimitedNominatimGeocoder {
    pub fn new(base_url: &str, min_interval: Duration) -> Result<Self> {
        Ok(Self {
            client: NominatimClient::new(base_url)?,
            rate_limiter: RateLimiter::new(min_interval),
        })
    }
}

#[async_trait]
impl ReverseGeocoder for RateLimitedNominatimGeocoder {
    async fn reverse_geocode(&self, point: Coordinates) -> Result<AddressEnvelope, GeocodeError> {
        self.rate_limiter.wait().await;

        let started = Instant::now();
        let result = self.client.reverse_geocode(point).await;
        debug!(
            "Nominatim reverse lookup for {},{} took {:?}",
            point.lat,
            point.lon,
            started.elapsed()
        );
        result
    }

    fn name(&self) -> &'static str {
        "nominatim"
    }
}

// ==========================================================================
// CachedReverseGeocoder
// ==========================================================================

/// Provider lookups memoized by rounded coordinates
pub struct CachedReverseGeocoder {
    inner: Arc<dyn ReverseGeocoder>,
    cache: Arc<GeocodeCache>,
}

impl CachedReverseGeocoder {
    pub fn new(inner: Arc<dyn ReverseGeocoder>, cache: Arc<GeocodeCache>) -> Self {
        Self { inner, cache }
    }

    /// Serialized address envelope for `point`.
    ///
    /// The provider gets the raw coordinates; only the cache key is rounded.
    /// Failures are not cached.
    pub async fn lookup(&self, point: Coordinates) -> Result<String, GeocodeError> {
        let key = cache_key(point);
        if let Some(cached) = self.cache.lookup(&key) {
            return Ok(cached);
        }

        let envelope = self.inner.reverse_geocode(point).await?;
        let serialized = serde_json::to_string(&envelope)?;
        let place = envelope.place_name().unwrap_or("unnamed place");
        if self.cache.store(key.clone(), serialized.clone()) {
            debug!("Cached geocode for {}: {} ({} entries)", key, place, self.cache.len());
        } else {
            debug!("Geocoded {}: {}", key, place);
        }
        Ok(serialized)
    }
}

// ==========================================================================
// Factory
// ==========================================================================

/// Provider configured by `REVERSE_GEOCODE_URL`, or `None` when enrichment is off
pub fn create_geocoder(config: &Config) -> Result<Option<Arc<dyn ReverseGeocoder>>> {
    let Some(base_url) = config.reverse_geocode_url.as_deref() else {
        info!("REVERSE_GEOCODE_URL not set, location enrichment disabled");
        return Ok(None);
    };

    let geocoder = RateLimitedNominatimGeocoder::new(base_url, config.geocode_rate_limit)?;
    info!(
        "Reverse geocoder '{}' at {} (min interval {:?})",
        geocoder.name(),
        base_url,
        config.geocode_rate_limit
    );
    Ok(Some(Arc::new(geocoder)))
}
