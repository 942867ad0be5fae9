//! Database module

pub mod queries;
pub mod store;

#[cfg(test)]
pub mod memory;

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

pub use store::{LocationStore, PgLocationStore, StoreError};

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    Ok(pool)
}

/// Run embedded migrations.
///
/// Applied versions that are no longer compiled into the binary are only
/// reported; sqlx refuses to run in that state, so the operator has to
/// decide what to do with them.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let migrator = sqlx::migrate!("./migrations");

    let compiled_versions: Vec<i64> = migrator
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .map(|m| m.version)
        .collect();

    for version in applied_versions(pool).await? {
        if !compiled_versions.contains(&version) {
            warn!("Applied migration {} is unknown to this build", version);
        }
    }

    migrator
        .run(pool)
        .await
        .context("Failed to apply migrations")?;

    info!("Database migrations complete (versions {:?})", compiled_versions);
    Ok(())
}

async fn applied_versions(pool: &PgPool) -> Result<Vec<i64>> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = '_sqlx_migrations')",
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(vec![]);
    }

    let rows: Vec<(i64,)> = sqlx::query_as("SELECT version FROM _sqlx_migrations ORDER BY version")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|(v,)| v).collect())
}
