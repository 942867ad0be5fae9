//! Location database queries

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::types::{Coordinates, LocationId, NewLocation};

/// Insert a location row, returning the store-assigned id.
///
/// A row with the same (user, device, devicetimestamp) fails with a
/// unique violation, which callers treat as an already-stored report.
pub async fn insert_location(pool: &PgPool, location: &NewLocation) -> Result<LocationId, sqlx::Error> {
    let (id,): (LocationId,) = sqlx::query_as(
        r#"
        INSERT INTO locations (
            timestamp, devicetimestamp, accuracy, doze, batterylevel,
            connectiontype, point, altitude, verticalaccuracy, speed, cog,
            "user", device
        )
        VALUES (
            $1, $2, $3, $4, $5,
            $6, ST_SetSRID(ST_MakePoint($7, $8), 4326), $9, $10, $11, $12,
            $13, $14
        )
        RETURNING id
        "#,
    )
    .bind(location.received_at)
    .bind(location.device_timestamp)
    .bind(location.accuracy)
    .bind(location.doze)
    .bind(location.battery)
    .bind(location.connection.as_deref())
    .bind(location.point.lon)
    .bind(location.point.lat)
    .bind(location.altitude)
    .bind(location.vertical_accuracy)
    .bind(location.speed)
    .bind(location.course)
    .bind(&location.identity.user)
    .bind(&location.identity.device)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Read back the point of a stored location
pub async fn get_location_point(pool: &PgPool, id: LocationId) -> Result<Option<Coordinates>, sqlx::Error> {
    let row: Option<(f64, f64)> = sqlx::query_as(
        r#"
        SELECT ST_Y(point) AS lat, ST_X(point) AS lon
        FROM locations
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(lat, lon)| Coordinates::new(lat, lon)))
}

/// Store the address envelope for a location.
///
/// Only un-enriched rows are touched, so the worker and the crawler racing
/// on the same row write the address once. Returns whether a row changed.
pub async fn set_location_geocoding(
    pool: &PgPool,
    id: LocationId,
    envelope_json: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE locations
        SET geocoding = $1::jsonb
        WHERE id = $2 AND geocoding IS NULL
        "#,
    )
    .bind(envelope_json)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Most recent un-enriched location reported before `cutoff`
pub async fn latest_unenriched_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Option<(LocationId, Coordinates)>, sqlx::Error> {
    let row: Option<(LocationId, f64, f64)> = sqlx::query_as(
        r#"
        SELECT id, ST_Y(point) AS lat, ST_X(point) AS lon
        FROM locations
        WHERE geocoding IS NULL
          AND devicetimestamp < $1
        ORDER BY devicetimestamp DESC
        LIMIT 1
        "#,
    )
    .bind(cutoff)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, lat, lon)| (id, Coordinates::new(lat, lon))))
}
