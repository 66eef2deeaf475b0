//! Schema versioning
//!
//! The schema written by [`crate::db::init`] is version 1. A database without
//! a recorded version was created by this build and is stamped with
//! [`CURRENT_SCHEMA_VERSION`]. Any later schema change bumps that constant
//! and adds its upgrade step here.

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Schema version this build writes
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Highest recorded schema version; 0 for a database that has none
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let has_table: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
    )
    .fetch_one(pool)
    .await?;

    if !has_table {
        return Ok(0);
    }

    let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Record [`CURRENT_SCHEMA_VERSION`] on a database that has no version yet
pub async fn stamp_schema_version(pool: &SqlitePool) -> Result<()> {
    let recorded = get_schema_version(pool).await?;

    if recorded == 0 {
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(pool)
            .await?;
        info!(version = CURRENT_SCHEMA_VERSION, "Recorded schema version");
    } else if recorded > CURRENT_SCHEMA_VERSION {
        warn!(
            database = recorded,
            code = CURRENT_SCHEMA_VERSION,
            "Database schema is newer than this build"
        );
    } else {
        info!("Database schema is up to date (v{})", recorded);
    }

    Ok(())
}
