//! Memoizing cache for reverse geocoding results
//!
//! Keys are coordinates rounded to five decimals (roughly one metre), so
//! reports from a stationary device share a single provider call. Entries
//! never expire; once a key is set its value does not change.

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::types::{AddressEnvelope, Coordinates};

const PRECISION: f64 = 1e5;

/// Round to five decimal places
pub fn round_coordinate(value: f64) -> f64 {
    (value * PRECISION).round() / PRECISION
}

pub fn cache_key(point: Coordinates) -> String {
    format!(
        "{:.5},{:.5}",
        round_coordinate(point.lat),
        round_coordinate(point.lon)
    )
}

#[derive(Debug, Default)]
pub struct GeocodeCache {
    entries: DashMap<String, String>,
    max_entries: Option<usize>,
}

impl GeocodeCache {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached envelope JSON for `key`.
    ///
    /// A value that no longer parses as an `AddressEnvelope` is evicted and
    /// reported as a miss.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let cached = self.entries.get(key).map(|entry| entry.value().clone())?;

        if serde_json::from_str::<AddressEnvelope>(&cached).is_ok() {
            debug!("Geocode cache hit for {}", key);
            return Some(cached);
        }

        warn!("Evicting unreadable geocode cache entry for {}", key);
        self.entries.remove(key);
        None
    }

    /// Remember `value` for `key`. Existing keys keep their first value.
    /// Returns false when the key was not admitted.
    pub fn store(&self, key: String, value: String) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        if let Some(max) = self.max_entries {
            if self.entries.len() >= max {
                debug!("Geocode cache full ({} entries), not admitting {}", max, key);
                return false;
            }
        }
        self.entries.entry(key).or_insert(value);
        true
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }
}
