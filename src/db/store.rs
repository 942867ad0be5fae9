//! Location store abstraction
//!
//! The pipeline only talks to `LocationStore`. `PgLocationStore` is the
//! production backend; driver errors are folded into `StoreError` here so
//! the writer's retry policy never sees `sqlx` types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use crate::db::queries;
use crate::types::{Coordinates, LocationId, NewLocation};

/// SQLSTATE class for integrity constraint violations
const INTEGRITY_CONSTRAINT_CLASS: &str = "23";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique, foreign key, not-null or check violation
    #[error("constraint violation ({code}): {message}")]
    Constraint { code: String, message: String },

    #[error("store call exceeded {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store is closed")]
    Closed,

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                if code.starts_with(INTEGRITY_CONSTRAINT_CLASS) {
                    StoreError::Constraint {
                        code,
                        message: db.message().to_string(),
                    }
                } else {
                    StoreError::Unexpected(anyhow::Error::new(sqlx::Error::Database(db)))
                }
            }
            sqlx::Error::PoolClosed => StoreError::Closed,
            sqlx::Error::PoolTimedOut => StoreError::Unavailable("connection pool timed out".to_string()),
            sqlx::Error::Io(e) => StoreError::Unavailable(e.to_string()),
            sqlx::Error::Tls(e) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Unexpected(other.into()),
        }
    }
}

/// A stored location that still has no address
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnenrichedLocation {
    pub id: LocationId,
    pub point: Coordinates,
}

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Insert a new location; duplicates fail with `StoreError::Constraint`
    async fn insert_location(&self, location: &NewLocation) -> Result<LocationId, StoreError>;

    async fn location_point(&self, id: LocationId) -> Result<Option<Coordinates>, StoreError>;

    /// Write the serialized address envelope. Returns false if the row was
    /// missing or already enriched.
    async fn update_geocoding(&self, id: LocationId, envelope_json: &str) -> Result<bool, StoreError>;

    /// Most recently reported un-enriched location older than `cutoff`
    async fn latest_unenriched_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<UnenrichedLocation>, StoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Postgres/PostGIS backend
#[derive(Clone)]
pub struct PgLocationStore {
    pool: PgPool,
}

impl PgLocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LocationStore for PgLocationStore {
    async fn insert_location(&self, location: &NewLocation) -> Result<LocationId, StoreError> {
        Ok(queries::location::insert_location(&self.pool, location).await?)
    }

    async fn location_point(&self, id: LocationId) -> Result<Option<Coordinates>, StoreError> {
        Ok(queries::location::get_location_point(&self.pool, id).await?)
    }

    async fn update_geocoding(&self, id: LocationId, envelope_json: &str) -> Result<bool, StoreError> {
        Ok(queries::location::set_location_geocoding(&self.pool, id, envelope_json).await?)
    }

    async fn latest_unenriched_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<UnenrichedLocation>, StoreError> {
        let row = queries::location::latest_unenriched_before(&self.pool, cutoff).await?;
        Ok(row.map(|(id, point)| UnenrichedLocation { id, point }))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
