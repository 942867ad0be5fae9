//! In-memory `LocationStore` for tests.
//!
//! Mirrors the Postgres behaviour the pipeline depends on: the
//! (user, device, devicetimestamp) unique constraint and the write-once
//! geocoding column. Failures and latency can be injected per insert.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::db::store::{LocationStore, StoreError, UnenrichedLocation};
use crate::types::{Coordinates, LocationId, NewLocation};

#[derive(Debug, Clone)]
pub struct StoredLocation {
    pub id: LocationId,
    pub location: NewLocation,
    pub geocoding: Option<String>,
}

#[derive(Default)]
pub struct MemoryLocationStore {
    rows: Mutex<Vec<StoredLocation>>,
    failing_inserts: AtomicU32,
    insert_attempts: AtomicU32,
    insert_delay: Mutex<Option<Duration>>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` inserts with `StoreError::Unavailable`.
    /// `u32::MAX` fails every insert.
    pub fn fail_next_inserts(&self, n: u32) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Sleep this long inside every insert
    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock() = Some(delay);
    }

    pub fn insert_attempts(&self) -> u32 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<StoredLocation> {
        self.rows.lock().clone()
    }

    pub fn geocoding(&self, id: LocationId) -> Option<String> {
        self.rows
            .lock()
            .iter()
            .find(|row| row.id == id)
            .and_then(|row| row.geocoding.clone())
    }

    /// Seed a row directly, bypassing failure injection
    pub fn seed(&self, location: NewLocation) -> LocationId {
        let mut rows = self.rows.lock();
        let id = rows.len() as LocationId + 1;
        rows.push(StoredLocation {
            id,
            location,
            geocoding: None,
        });
        id
    }

    fn take_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn insert_location(&self, location: &NewLocation) -> Result<LocationId, StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.insert_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut rows = self.rows.lock();
        let duplicate = rows.iter().any(|row| {
            row.location.identity == location.identity
                && row.location.device_timestamp == location.device_timestamp
        });
        if duplicate {
            return Err(StoreError::Constraint {
                code: "23505".to_string(),
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }

        let id = rows.len() as LocationId + 1;
        rows.push(StoredLocation {
            id,
            location: location.clone(),
            geocoding: None,
        });
        Ok(id)
    }

    async fn location_point(&self, id: LocationId) -> Result<Option<Coordinates>, StoreError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.location.point))
    }

    async fn update_geocoding(&self, id: LocationId, envelope_json: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|row| row.id == id && row.geocoding.is_none()) {
            Some(row) => {
                row.geocoding = Some(envelope_json.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn latest_unenriched_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<UnenrichedLocation>, StoreError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|row| row.geocoding.is_none() && row.location.device_timestamp < cutoff)
            .max_by_key(|row| row.location.device_timestamp)
            .map(|row| UnenrichedLocation {
                id: row.id,
                point: row.location.point,
            }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Minimal valid location for tests
pub fn sample_location(user: &str, device: &str, device_timestamp: DateTime<Utc>) -> NewLocation {
    NewLocation {
        received_at: Utc::now(),
        device_timestamp,
        accuracy: 10.0,
        vertical_accuracy: None,
        altitude: None,
        speed: None,
        course: None,
        doze: false,
        battery: None,
        connection: None,
        point: Coordinates::new(51.95265, 7.63247),
        identity: crate::types::Identity {
            user: user.to_string(),
            device: device.to_string(),
        },
        message_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_identity_and_timestamp_is_constraint_violation() {
        let store = MemoryLocationStore::new();
        let ts = Utc::now();
        let location = sample_location("alice", "phone", ts);

        let id = store.insert_location(&location).await.unwrap();
        assert_eq!(id, 1);

        let err = store.insert_location(&location).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint { ref code, .. } if code == "23505"));
        assert_eq!(store.rows().len(), 1);

        // Different device is a different row
        store
            .insert_location(&sample_location("alice", "tablet", ts))
            .await
            .unwrap();
        assert_eq!(store.rows().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryLocationStore::new();
        store.fail_next_inserts(2);
        let location = sample_location("alice", "phone", Utc::now());

        assert!(store.insert_location(&location).await.is_err());
        assert!(store.insert_location(&location).await.is_err());
        assert!(store.insert_location(&location).await.is_ok());
        assert_eq!(store.insert_attempts(), 3);
    }

    #[tokio::test]
    async fn geocoding_is_written_once() {
        let store = MemoryLocationStore::new();
        let id = store.seed(sample_location("alice", "phone", Utc::now()));

        assert!(store.update_geocoding(id, r#"{"address":{}}"#).await.unwrap());
        assert!(!store.update_geocoding(id, r#"{"address":{"city":"x"}}"#).await.unwrap());
        assert_eq!(store.geocoding(id).as_deref(), Some(r#"{"address":{}}"#));
    }
}
