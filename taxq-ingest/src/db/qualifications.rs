//! Qualification record store
//!
//! Records are addressed by their composite identity
//! `(scope, market, instrument, payment_date, exercise_year)`. Every write is
//! an upsert against that identity, so re-ingesting the same row updates it in
//! place instead of adding a duplicate.
//!
//! Write functions take an executor or `&mut SqliteConnection` so callers can
//! run them inside their own transaction.

use sqlx::{Row, SqliteConnection, SqliteExecutor, SqlitePool};
use taxq_common::db::{
    Currency, FactorStatus, Market, Provenance, Qualification, QualificationKey, Scope,
};
use taxq_common::{time, AmountSlots, Error, FactorSlots, Result};
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    SELECT guid, scope, market, instrument, payment_date, exercise_year,
           amounts, factors, currency, provenance, factor_status,
           created_at, updated_at, updated_by
    FROM qualifications
"#;

const INSERT_PREFIX: &str = r#"
    INSERT INTO qualifications (
        guid, scope, broker_guid, market, instrument, payment_date, exercise_year,
        amounts, factors, currency, provenance, factor_status,
        created_at, updated_at, updated_by
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'CURRENT', ?, ?, ?)
    ON CONFLICT(scope, market, instrument, payment_date, exercise_year) DO UPDATE SET
"#;

const UPDATE_AMOUNTS_AND_FACTORS: &str = r#"
        amounts = excluded.amounts,
        factors = excluded.factors,
        currency = excluded.currency,
        provenance = excluded.provenance,
        factor_status = 'CURRENT',
        updated_at = excluded.updated_at,
        updated_by = excluded.updated_by
    RETURNING guid
"#;

const UPDATE_FACTORS_ONLY: &str = r#"
        factors = excluded.factors,
        currency = excluded.currency,
        provenance = excluded.provenance,
        factor_status = 'CURRENT',
        updated_at = excluded.updated_at,
        updated_by = excluded.updated_by
    RETURNING guid
"#;

/// Slot data written by an upsert
///
/// Factors are always written whole: either derived from the amounts written
/// alongside them, or supplied directly with the stored amounts left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    /// Amounts plus the factors computed from them
    AmountsAndFactors {
        amounts: AmountSlots,
        factors: FactorSlots,
    },
    /// Directly supplied factors; amounts are zero on create and untouched on update
    FactorsOnly { factors: FactorSlots },
}

/// Validated write for one composite identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertRequest {
    pub key: QualificationKey,
    pub slots: SlotWrite,
    pub currency: Currency,
    pub provenance: Provenance,
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub guid: Uuid,
    pub created: bool,
}

/// Amount-only write from the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAmountWrite {
    pub scope: Scope,
    pub market: Market,
    pub instrument: String,
    pub payment_date: chrono::NaiveDate,
    pub exercise_year: i32,
    pub amount: rust_decimal::Decimal,
    pub currency: Currency,
}

fn encode_slots(slots: &AmountSlots) -> Result<String> {
    serde_json::to_string(slots)
        .map_err(|e| Error::Internal(format!("Failed to serialize slots: {}", e)))
}

fn decode_slots(column: &str, text: &str) -> Result<AmountSlots> {
    serde_json::from_str(text)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", column, e)))
}

fn row_to_qualification(row: &sqlx::sqlite::SqliteRow) -> Result<Qualification> {
    let guid: String = row.get("guid");
    let scope: String = row.get("scope");
    let market: String = row.get("market");
    let payment_date: String = row.get("payment_date");
    let amounts: String = row.get("amounts");
    let factors: String = row.get("factors");
    let currency: String = row.get("currency");
    let provenance: String = row.get("provenance");
    let factor_status: String = row.get("factor_status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Qualification {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("Corrupt qualification guid {:?}: {}", guid, e)))?,
        key: QualificationKey {
            scope: Scope::from_storage_key(&scope)?,
            market: Market::from_code(&market)
                .ok_or_else(|| Error::Internal(format!("Unknown stored market {:?}", market)))?,
            instrument: row.get("instrument"),
            payment_date: time::parse_stored_date(&payment_date)?,
            exercise_year: row.get("exercise_year"),
        },
        amounts: decode_slots("amounts", &amounts)?,
        factors: decode_slots("factors", &factors)?,
        currency: Currency::from_code(&currency)
            .ok_or_else(|| Error::Internal(format!("Unknown stored currency {:?}", currency)))?,
        provenance: provenance.parse()?,
        factor_status: factor_status.parse()?,
        created_at: time::parse_timestamp(&created_at)?,
        updated_at: time::parse_timestamp(&updated_at)?,
        updated_by: row.get("updated_by"),
    })
}

/// Create or update the record for `request.key`
///
/// Runs as one statement, so concurrent upserts of the same identity are
/// serialized by SQLite.
pub async fn upsert<'e, E>(executor: E, request: &UpsertRequest, actor: &str) -> Result<UpsertOutcome>
where
    E: SqliteExecutor<'e>,
{
    let new_guid = Uuid::new_v4();
    let now = time::format_timestamp(time::now());

    let (amounts, factors, update_clause) = match &request.slots {
        SlotWrite::AmountsAndFactors { amounts, factors } => {
            (*amounts, *factors, UPDATE_AMOUNTS_AND_FACTORS)
        }
        SlotWrite::FactorsOnly { factors } => {
            (AmountSlots::zero(), *factors, UPDATE_FACTORS_ONLY)
        }
    };
    let sql = format!("{}{}", INSERT_PREFIX, update_clause);

    let key = &request.key;
    let stored_guid: String = sqlx::query_scalar(&sql)
        .bind(new_guid.to_string())
        .bind(key.scope.storage_key())
        .bind(key.scope.broker_guid().map(|g| g.to_string()))
        .bind(key.market.as_str())
        .bind(&key.instrument)
        .bind(time::format_date(key.payment_date))
        .bind(key.exercise_year)
        .bind(encode_slots(&amounts)?)
        .bind(encode_slots(&factors)?)
        .bind(request.currency.as_str())
        .bind(request.provenance.as_str())
        .bind(&now)
        .bind(&now)
        .bind(actor)
        .fetch_one(executor)
        .await?;

    let guid = Uuid::parse_str(&stored_guid)
        .map_err(|e| Error::Internal(format!("Corrupt qualification guid {:?}: {}", stored_guid, e)))?;

    Ok(UpsertOutcome {
        guid,
        created: guid == new_guid,
    })
}

/// Apply an event amount to the record matching (scope, market, instrument, date)
///
/// The event stream does not know the exercise year of an existing record, so
/// it matches without it and refreshes the year from the event. Only amount
/// slot 1 is replaced; the remaining amounts and the whole factor vector are
/// preserved and marked [`FactorStatus::Pending`] for recalculation.
///
/// Reads and writes on `conn`; run it inside a transaction.
pub async fn upsert_event_amount(
    conn: &mut SqliteConnection,
    write: &EventAmountWrite,
    actor: &str,
) -> Result<UpsertOutcome> {
    let now = time::format_timestamp(time::now());
    let payment_date = time::format_date(write.payment_date);

    let existing = sqlx::query(&format!(
        "{} WHERE scope = ? AND market = ? AND instrument = ? AND payment_date = ? \
         ORDER BY (exercise_year = ?) DESC, updated_at DESC LIMIT 1",
        SELECT_COLUMNS
    ))
    .bind(write.scope.storage_key())
    .bind(write.market.as_str())
    .bind(&write.instrument)
    .bind(&payment_date)
    .bind(write.exercise_year)
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        Some(row) => {
            let mut record = row_to_qualification(&row)?;
            record.amounts.set(1, write.amount);

            sqlx::query(
                r#"
                UPDATE qualifications SET
                    exercise_year = ?,
                    amounts = ?,
                    currency = ?,
                    provenance = ?,
                    factor_status = ?,
                    updated_at = ?,
                    updated_by = ?
                WHERE guid = ?
                "#,
            )
            .bind(write.exercise_year)
            .bind(encode_slots(&record.amounts)?)
            .bind(write.currency.as_str())
            .bind(Provenance::Event.as_str())
            .bind(FactorStatus::Pending.as_str())
            .bind(&now)
            .bind(actor)
            .bind(record.guid.to_string())
            .execute(&mut *conn)
            .await?;

            Ok(UpsertOutcome {
                guid: record.guid,
                created: false,
            })
        }
        None => {
            let guid = Uuid::new_v4();
            let mut amounts = AmountSlots::zero();
            amounts.set(1, write.amount);

            sqlx::query(
                r#"
                INSERT INTO qualifications (
                    guid, scope, broker_guid, market, instrument, payment_date, exercise_year,
                    amounts, factors, currency, provenance, factor_status,
                    created_at, updated_at, updated_by
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(guid.to_string())
            .bind(write.scope.storage_key())
            .bind(write.scope.broker_guid().map(|g| g.to_string()))
            .bind(write.market.as_str())
            .bind(&write.instrument)
            .bind(&payment_date)
            .bind(write.exercise_year)
            .bind(encode_slots(&amounts)?)
            .bind(encode_slots(&FactorSlots::zero())?)
            .bind(write.currency.as_str())
            .bind(Provenance::Event.as_str())
            .bind(FactorStatus::Pending.as_str())
            .bind(&now)
            .bind(&now)
            .bind(actor)
            .execute(&mut *conn)
            .await?;

            Ok(UpsertOutcome {
                guid,
                created: true,
            })
        }
    }
}

/// Settle a PENDING record after recalculation
///
/// `basis` is the amount vector the factors were computed from. The write only
/// applies while the record is still PENDING with exactly those amounts, so a
/// newer event that landed in between is left for the next pass. `factors` of
/// `None` keeps the stored vector (used when the amounts were rejected).
///
/// Returns false when the record changed underneath and nothing was written.
pub async fn settle_pending<'e, E>(
    executor: E,
    guid: Uuid,
    basis: &AmountSlots,
    factors: Option<&FactorSlots>,
    status: FactorStatus,
    actor: &str,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let factors = factors.map(encode_slots).transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE qualifications SET
            factors = COALESCE(?, factors),
            factor_status = ?,
            updated_at = ?,
            updated_by = ?
        WHERE guid = ? AND factor_status = 'PENDING' AND amounts = ?
        "#,
    )
    .bind(factors)
    .bind(status.as_str())
    .bind(time::format_timestamp(time::now()))
    .bind(actor)
    .bind(guid.to_string())
    .bind(encode_slots(basis)?)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a record owned by `scope`; returns false when no such record exists
pub async fn delete<'e, E>(executor: E, guid: Uuid, scope: Scope) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM qualifications WHERE guid = ? AND scope = ?")
        .bind(guid.to_string())
        .bind(scope.storage_key())
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Load one record by composite identity
pub async fn get_by_key<'e, E>(executor: E, key: &QualificationKey) -> Result<Option<Qualification>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "{} WHERE scope = ? AND market = ? AND instrument = ? AND payment_date = ? AND exercise_year = ?",
        SELECT_COLUMNS
    ))
    .bind(key.scope.storage_key())
    .bind(key.market.as_str())
    .bind(&key.instrument)
    .bind(time::format_date(key.payment_date))
    .bind(key.exercise_year)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(row_to_qualification).transpose()
}

/// Load one record by guid
pub async fn get_by_guid<'e, E>(executor: E, guid: Uuid) -> Result<Option<Qualification>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!("{} WHERE guid = ?", SELECT_COLUMNS))
        .bind(guid.to_string())
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(row_to_qualification).transpose()
}

/// Every record owned by `scope`
pub async fn list_by_scope(pool: &SqlitePool, scope: Scope) -> Result<Vec<Qualification>> {
    let rows = sqlx::query(&format!("{} WHERE scope = ?", SELECT_COLUMNS))
        .bind(scope.storage_key())
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_qualification).collect()
}

/// Every record regardless of owner
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Qualification>> {
    let rows = sqlx::query(SELECT_COLUMNS).fetch_all(pool).await?;

    rows.iter().map(row_to_qualification).collect()
}

/// Records in one factor status, oldest update first
pub async fn list_by_factor_status(
    pool: &SqlitePool,
    status: FactorStatus,
) -> Result<Vec<Qualification>> {
    let rows = sqlx::query(&format!(
        "{} WHERE factor_status = ? ORDER BY updated_at ASC",
        SELECT_COLUMNS
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_qualification).collect()
}

/// Number of stored records (all owners)
pub async fn count<'e, E>(executor: E) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM qualifications")
        .fetch_one(executor)
        .await?;
    Ok(total)
}
