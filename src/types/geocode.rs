//! Reverse geocoding result types

use serde::{Deserialize, Serialize};

/// Canonical address envelope stored in `locations.geocoding`.
///
/// Parsed from the provider response and re-serialized, so the stored JSON
/// always has the same shape regardless of which Nominatim build answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osm_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osm_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(alias = "components")]
    pub address: AddressComponents,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundingbox: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressComponents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suburb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub village: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub town: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

impl AddressEnvelope {
    /// Most specific settlement name: city, town, village, municipality, then county.
    pub fn place_name(&self) -> Option<&str> {
        let a = &self.address;
        [&a.city, &a.town, &a.village, &a.municipality, &a.county]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .find(|name| !name.trim().is_empty())
    }
}
