//! Nominatim reverse geocoding client

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::services::geocoding::GeocodeError;
use crate::types::{AddressEnvelope, Coordinates};

const USER_AGENT: &str = concat!("owntracks-recorder/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Nominatim answers unknown places with 200 and an `error` body
#[derive(Debug, Deserialize)]
struct NominatimErrorBody {
    error: String,
}

/// Nominatim HTTP client
pub struct NominatimClient {
    base_url: String,
    client: reqwest::Client,
}

impl NominatimClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn reverse_url(&self, point: Coordinates) -> String {
        format!(
            "{}/reverse?lat={}&lon={}&format=json&addressdetails=1",
            self.base_url, point.lat, point.lon
        )
    }

    /// Reverse geocode the raw (unrounded) coordinates
    pub async fn reverse_geocode(&self, point: Coordinates) -> Result<AddressEnvelope, GeocodeError> {
        let response = self.client.get(self.reverse_url(point)).send().await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(GeocodeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_reverse_response(&body)
    }
}

pub fn parse_reverse_response(body: &str) -> Result<AddressEnvelope, GeocodeError> {
    if let Ok(err) = serde_json::from_str::<NominatimErrorBody>(body) {
        return Err(GeocodeError::Provider(err.error));
    }
    Ok(serde_json::from_str(body)?)
}
