//! Broker (tenant) database operations
//!
//! Ingestion paths receive a human-chosen broker code and translate it into
//! a [`Broker`] here. An unknown code is [`Error::NotFound`]: the caller skips
//! the item, it never falls back to a default tenant.

use sqlx::{Row, SqlitePool};
use taxq_common::db::Broker;
use taxq_common::{time, Error, Result};
use tracing::info;
use uuid::Uuid;

fn row_to_broker(row: &sqlx::sqlite::SqliteRow) -> Result<Broker> {
    let guid: String = row.get("guid");
    Ok(Broker {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("Corrupt broker guid {:?}: {}", guid, e)))?,
        code: row.get("code"),
        name: row.get("name"),
    })
}

/// Register a new broker (administrative operation)
pub async fn create_broker(pool: &SqlitePool, code: &str, name: &str) -> Result<Broker> {
    let code = code.trim();
    let name = name.trim();
    if code.is_empty() || name.is_empty() {
        return Err(Error::InvalidInput(
            "broker code and name must not be empty".to_string(),
        ));
    }

    let broker = Broker {
        guid: Uuid::new_v4(),
        code: code.to_string(),
        name: name.to_string(),
    };

    sqlx::query("INSERT INTO brokers (guid, code, name, created_at) VALUES (?, ?, ?, ?)")
        .bind(broker.guid.to_string())
        .bind(&broker.code)
        .bind(&broker.name)
        .bind(time::format_timestamp(time::now()))
        .execute(pool)
        .await?;

    info!(code = %broker.code, guid = %broker.guid, "Broker registered");
    Ok(broker)
}

/// Resolve a broker by its external code
pub async fn resolve_broker(pool: &SqlitePool, code: &str) -> Result<Broker> {
    let code = code.trim();
    let row = sqlx::query("SELECT guid, code, name FROM brokers WHERE code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => row_to_broker(&row),
        None => Err(Error::NotFound(format!("broker code {:?}", code))),
    }
}

/// Load a broker by guid
pub async fn find_broker(pool: &SqlitePool, guid: Uuid) -> Result<Option<Broker>> {
    let row = sqlx::query("SELECT guid, code, name FROM brokers WHERE guid = ?")
        .bind(guid.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_broker).transpose()
}

/// All brokers ordered by code
pub async fn list_brokers(pool: &SqlitePool) -> Result<Vec<Broker>> {
    let rows = sqlx::query("SELECT guid, code, name FROM brokers ORDER BY code")
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_broker).collect()
}

/// Link a user account to a broker, or record it as unassigned
///
/// Called explicitly by the account provisioning collaborator. Re-provisioning
/// an existing username moves it to the new broker.
pub async fn provision_user_profile(
    pool: &SqlitePool,
    username: &str,
    broker_code: Option<&str>,
) -> Result<()> {
    let username = username.trim();
    if username.is_empty() {
        return Err(Error::InvalidInput("username must not be empty".to_string()));
    }

    let broker = match broker_code {
        Some(code) => Some(resolve_broker(pool, code).await?),
        None => None,
    };

    sqlx::query(
        r#"
        INSERT INTO user_profiles (username, broker_guid, created_at) VALUES (?, ?, ?)
        ON CONFLICT(username) DO UPDATE SET broker_guid = excluded.broker_guid
        "#,
    )
    .bind(username)
    .bind(broker.as_ref().map(|b| b.guid.to_string()))
    .bind(time::format_timestamp(time::now()))
    .execute(pool)
    .await?;

    info!(
        username,
        broker = broker.as_ref().map(|b| b.code.as_str()).unwrap_or("<unassigned>"),
        "User profile provisioned"
    );
    Ok(())
}

/// Broker linked to a user account, if any
pub async fn broker_for_user(pool: &SqlitePool, username: &str) -> Result<Option<Broker>> {
    let row = sqlx::query(
        r#"
        SELECT b.guid, b.code, b.name
        FROM user_profiles p
        JOIN brokers b ON b.guid = p.broker_guid
        WHERE p.username = ?
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_broker).transpose()
}
