//! Audit log persistence
//!
//! Append-only: this module inserts and reads entries, it never updates or
//! deletes them. Writers pass the same connection as the mutation they
//! describe so the entry commits or rolls back with it.

use sqlx::{Row, SqliteExecutor, SqlitePool};
use taxq_common::db::{AuditAction, AuditEntry};
use taxq_common::{time, Error, Result};
use uuid::Uuid;

/// Entry to append
#[derive(Debug, Clone)]
pub struct NewAuditEntry<'a> {
    pub actor: &'a str,
    pub action: AuditAction,
    pub qualification_guid: Option<Uuid>,
    pub details: String,
}

/// Append one entry, returning its guid
pub async fn append<'e, E>(executor: E, entry: NewAuditEntry<'_>) -> Result<Uuid>
where
    E: SqliteExecutor<'e>,
{
    let guid = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO audit_log (guid, actor, action, qualification_guid, details, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(guid.to_string())
    .bind(entry.actor)
    .bind(entry.action.as_str())
    .bind(entry.qualification_guid.map(|g| g.to_string()))
    .bind(&entry.details)
    .bind(time::format_timestamp(time::now()))
    .execute(executor)
    .await?;

    Ok(guid)
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let guid: String = row.get("guid");
    let qualification_guid: Option<String> = row.get("qualification_guid");
    let timestamp: String = row.get("timestamp");

    Ok(AuditEntry {
        guid: parse_guid(&guid)?,
        actor: row.get("actor"),
        action: row.get("action"),
        qualification_guid: qualification_guid.as_deref().map(parse_guid).transpose()?,
        details: row.get("details"),
        timestamp: time::parse_timestamp(&timestamp)?,
    })
}

fn parse_guid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Internal(format!("Corrupt guid {:?}: {}", text, e)))
}

/// Most recent entries, newest first
///
/// With `actor` set only that actor's entries are returned (a regular user's
/// own history); `None` returns everyone's (superuser view).
pub async fn recent_entries(
    pool: &SqlitePool,
    actor: Option<&str>,
    limit: i64,
) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT guid, actor, action, qualification_guid, details, timestamp
        FROM audit_log
        WHERE (?1 IS NULL OR actor = ?1)
        ORDER BY timestamp DESC, rowid DESC
        LIMIT ?2
        "#,
    )
    .bind(actor)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_entry).collect()
}

/// Every entry recorded against one qualification, oldest first
pub async fn entries_for_qualification(pool: &SqlitePool, guid: Uuid) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT guid, actor, action, qualification_guid, details, timestamp
        FROM audit_log
        WHERE qualification_guid = ?
        ORDER BY timestamp ASC, rowid ASC
        "#,
    )
    .bind(guid.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_entry).collect()
}
