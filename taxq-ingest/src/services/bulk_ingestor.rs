//! Bulk file ingestion
//!
//! Loads a delimited file of amounts or factors into one scope. The whole file
//! is a single transaction: a bad payment date or a factor sum above 1 on any
//! row rolls back every row written before it.

use crate::db::audit::{self, NewAuditEntry};
use crate::db::qualifications::{self, SlotWrite, UpsertRequest};
use crate::error::IngestError;
use crate::services::tabular::{self, TableRow};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;
use taxq_common::db::{AuditAction, Currency, Market, Provenance, QualificationKey, Scope};
use taxq_common::{factor, time, Slots};
use tracing::{debug, info, warn};

pub const MARKET_COLUMNS: [&str; 2] = ["mercado", "market"];
pub const INSTRUMENT_COLUMNS: [&str; 2] = ["instrumento", "instrument"];
pub const DATE_COLUMNS: [&str; 2] = ["fecha_pago", "payment_date"];
pub const YEAR_COLUMNS: [&str; 3] = ["ejercicio", "exercise_year", "year"];
pub const CURRENCY_COLUMNS: [&str; 2] = ["moneda", "currency"];

/// Which slot family the file carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// `amount1..amount29`; factors are computed
    Amounts,
    /// `factor1..factor29`; validated and stored as given
    Factors,
}

impl BulkMode {
    fn column_prefix(&self) -> &'static str {
        match self {
            BulkMode::Amounts => "amount",
            BulkMode::Factors => "factor",
        }
    }

    fn provenance(&self) -> Provenance {
        match self {
            BulkMode::Amounts => Provenance::BulkAmounts,
            BulkMode::Factors => Provenance::BulkFactors,
        }
    }

    fn audit_action(&self) -> AuditAction {
        match self {
            BulkMode::Amounts => AuditAction::BulkLoadAmounts,
            BulkMode::Factors => AuditAction::BulkLoadFactors,
        }
    }
}

impl fmt::Display for BulkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkMode::Amounts => write!(f, "AMOUNTS"),
            BulkMode::Factors => write!(f, "FACTORS"),
        }
    }
}

/// Counts reported by a committed load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkLoadSummary {
    pub created: usize,
    pub updated: usize,
    /// Rows missing market, instrument or exercise year, or naming an unknown market
    pub skipped: usize,
}

/// Validated content of one row
struct RowWrite {
    request: UpsertRequest,
}

/// Load `content` into `scope`
///
/// Returns the counts of a committed load, or the single error that aborted
/// it. Nothing is persisted when an error is returned.
pub async fn ingest(
    pool: &SqlitePool,
    actor: &str,
    scope: Scope,
    content: &str,
    mode: BulkMode,
) -> Result<BulkLoadSummary, IngestError> {
    let table = tabular::parse(content).map_err(|e| IngestError::Malformed(e.to_string()))?;

    debug!(
        scope = %scope.storage_key(),
        %mode,
        rows = table.rows.len(),
        separator = ?table.separator,
        "Starting bulk load"
    );

    let mut summary = BulkLoadSummary::default();
    let mut tx = pool.begin().await?;

    for row in &table.rows {
        let Some(write) = prepare_row(row, scope, mode)? else {
            summary.skipped += 1;
            continue;
        };

        let outcome = qualifications::upsert(&mut *tx, &write.request, actor).await?;
        if outcome.created {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }

        let key = &write.request.key;
        audit::append(
            &mut *tx,
            NewAuditEntry {
                actor,
                action: mode.audit_action(),
                qualification_guid: Some(outcome.guid),
                details: format!(
                    "row {}: {} {} paid {} year {} {}",
                    row.line,
                    key.market,
                    key.instrument,
                    key.payment_date,
                    key.exercise_year,
                    if outcome.created { "created" } else { "updated" }
                ),
            },
        )
        .await?;
    }

    audit::append(
        &mut *tx,
        NewAuditEntry {
            actor,
            action: AuditAction::BulkLoad,
            qualification_guid: None,
            details: format!(
                "{} load into {}: {} created, {} updated, {} skipped",
                mode,
                scope.storage_key(),
                summary.created,
                summary.updated,
                summary.skipped
            ),
        },
    )
    .await?;

    tx.commit().await?;

    info!(
        scope = %scope.storage_key(),
        %mode,
        created = summary.created,
        updated = summary.updated,
        skipped = summary.skipped,
        "Bulk load committed"
    );

    Ok(summary)
}

/// Validate one row; `Ok(None)` means skip it
fn prepare_row(row: &TableRow, scope: Scope, mode: BulkMode) -> Result<Option<RowWrite>, IngestError> {
    let instrument = row.first_of(&INSTRUMENT_COLUMNS);

    let raw_date = row.first_of(&DATE_COLUMNS).unwrap_or_default();
    let payment_date = time::parse_payment_date(raw_date).map_err(|_| IngestError::BadDate {
        row: row.line,
        instrument: instrument.unwrap_or_default().to_string(),
        raw: raw_date.to_string(),
    })?;

    let market = row.first_of(&MARKET_COLUMNS);
    let exercise_year = row
        .first_of(&YEAR_COLUMNS)
        .and_then(|raw| raw.parse::<i32>().ok());

    let (Some(market), Some(instrument), Some(exercise_year)) = (market, instrument, exercise_year)
    else {
        warn!(
            row = row.line,
            market = market.unwrap_or_default(),
            instrument = instrument.unwrap_or_default(),
            year = row.first_of(&YEAR_COLUMNS).unwrap_or_default(),
            "Skipping row with incomplete identity"
        );
        return Ok(None);
    };

    let Some(market) = Market::from_code(market) else {
        warn!(row = row.line, market, instrument, "Skipping row with unknown market");
        return Ok(None);
    };

    let prefix = mode.column_prefix();
    let values = Slots::from_tokens(|index| row.get(&format!("{}{}", prefix, index)));

    let invalid = |source| IngestError::Invalid {
        row: row.line,
        instrument: instrument.to_string(),
        payment_date,
        source,
    };
    let slots = match mode {
        BulkMode::Amounts => SlotWrite::AmountsAndFactors {
            amounts: values,
            factors: factor::compute(&values).map_err(invalid)?,
        },
        BulkMode::Factors => {
            factor::validate_factor_sum(&values).map_err(invalid)?;
            SlotWrite::FactorsOnly { factors: values }
        }
    };

    let currency = match row.first_of(&CURRENCY_COLUMNS) {
        None => Currency::default(),
        Some(code) => Currency::from_code(code).unwrap_or_else(|| {
            warn!(row = row.line, currency = code, "Unknown currency, using CLP");
            Currency::default()
        }),
    };

    Ok(Some(RowWrite {
        request: UpsertRequest {
            key: QualificationKey {
                scope,
                market,
                instrument: instrument.to_string(),
                payment_date,
                exercise_year,
            },
            slots,
            currency,
            provenance: mode.provenance(),
        },
    }))
}
