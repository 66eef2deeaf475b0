//! Database initialization
//!
//! Creates the database file and every table on first run; reopening an
//! existing database leaves its tables and data untouched.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default SQLite busy timeout in milliseconds
pub const DEFAULT_BUSY_TIMEOUT_MS: i64 = 250;

/// Busy timeout used while creating the schema
const BOOTSTRAP_BUSY_TIMEOUT_MS: u64 = 5000;

fn connect_options(db_path: &Path, busy_timeout_ms: u64) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        // Required for ON DELETE RESTRICT on brokers
        .foreign_keys(true)
        // WAL lets the reconciliation view read while an ingestor writes
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(busy_timeout_ms))
}

/// Initialize database connection and create tables if needed
///
/// Connection pragmas are applied to every pooled connection. The busy
/// timeout comes from the `database_busy_timeout_ms` setting; writers that
/// exceed it retry with backoff.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let bootstrap = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(db_path, BOOTSTRAP_BUSY_TIMEOUT_MS))
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Idempotent - safe to call multiple times
    create_schema_version_table(&bootstrap).await?;
    create_settings_table(&bootstrap).await?;
    create_brokers_table(&bootstrap).await?;
    create_user_profiles_table(&bootstrap).await?;
    create_qualifications_table(&bootstrap).await?;
    create_audit_log_table(&bootstrap).await?;

    crate::db::migrations::stamp_schema_version(&bootstrap).await?;

    init_default_settings(&bootstrap).await?;

    let timeout_ms: i64 = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'database_busy_timeout_ms'",
    )
    .fetch_optional(&bootstrap)
    .await?
    .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
    bootstrap.close().await;

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(connect_options(db_path, timeout_ms.max(0) as u64))
        .await?;

    info!("Database busy timeout set to {} ms", timeout_ms);

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_brokers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS brokers (
            guid TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_user_profiles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_profiles (
            username TEXT PRIMARY KEY,
            broker_guid TEXT REFERENCES brokers(guid) ON DELETE RESTRICT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the qualifications table
///
/// `scope` is `'bolsa'` for exchange-wide records, otherwise the owning broker
/// guid, so the unique identity never contains NULL.
async fn create_qualifications_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS qualifications (
            guid TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            broker_guid TEXT REFERENCES brokers(guid) ON DELETE RESTRICT,
            market TEXT NOT NULL CHECK (market IN ('acciones', 'cfi', 'fondos_mutuos')),
            instrument TEXT NOT NULL,
            payment_date TEXT NOT NULL,
            exercise_year INTEGER NOT NULL,
            amounts TEXT NOT NULL,
            factors TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'CLP',
            provenance TEXT NOT NULL,
            factor_status TEXT NOT NULL DEFAULT 'CURRENT',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by TEXT NOT NULL,
            UNIQUE (scope, market, instrument, payment_date, exercise_year),
            CHECK ((scope = 'bolsa') = (broker_guid IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_qualifications_scope ON qualifications(scope)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the append-only audit log
///
/// `qualification_guid` carries no foreign key: entries outlive deleted records.
async fn create_audit_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            guid TEXT PRIMARY KEY,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            qualification_guid TEXT,
            details TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Also handles NULL values by resetting them to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    ensure_setting(
        pool,
        "database_busy_timeout_ms",
        &DEFAULT_BUSY_TIMEOUT_MS.to_string(),
    )
    .await?;

    Ok(())
}

/// Ensure a setting exists with a default value
///
/// Inserts the setting if missing, or resets it if its value is NULL.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        WHERE settings.value IS NULL
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(pool)
    .await?;

    Ok(())
}
