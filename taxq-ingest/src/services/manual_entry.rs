//! Single-record entry and deletion
//!
//! The form-driven path: one record at a time, raw tokens normalized the same
//! way as bulk files and events. Each call is its own transaction with its
//! audit entry.

use crate::db::audit::{self, NewAuditEntry};
use crate::db::qualifications::{self, SlotWrite, UpsertOutcome, UpsertRequest};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use taxq_common::db::{AuditAction, Currency, Market, Provenance, QualificationKey, Scope};
use taxq_common::{factor, time, Error, Result, Slots};
use tracing::info;
use uuid::Uuid;

/// Raw form submission for one record
///
/// `values` maps slot index (1..=29) to the raw token typed by the user;
/// absent or blank slots are zero.
#[derive(Debug, Clone, Default)]
pub struct ManualEntry {
    pub market: String,
    pub instrument: String,
    pub payment_date: String,
    pub exercise_year: i32,
    pub currency: Option<String>,
    pub values: BTreeMap<usize, String>,
}

impl ManualEntry {
    fn key(&self, scope: Scope) -> Result<QualificationKey> {
        let market = self.market.trim();
        let instrument = self.instrument.trim();
        if market.is_empty() || instrument.is_empty() {
            return Err(Error::InvalidInput(
                "market and instrument are required".to_string(),
            ));
        }
        let market = Market::from_code(market)
            .ok_or_else(|| Error::InvalidInput(format!("unknown market {:?}", market)))?;

        Ok(QualificationKey {
            scope,
            market,
            instrument: instrument.to_string(),
            payment_date: time::parse_payment_date(&self.payment_date)?,
            exercise_year: self.exercise_year,
        })
    }

    fn slots(&self) -> Slots {
        Slots::from_tokens(|index| self.values.get(&index).map(String::as_str))
    }

    fn currency(&self) -> Result<Currency> {
        match self.currency.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            None => Ok(Currency::default()),
            Some(code) => Currency::from_code(code)
                .ok_or_else(|| Error::InvalidInput(format!("unknown currency {:?}", code))),
        }
    }
}

/// Save amounts and the factors computed from them
///
/// A factor sum above 1 is returned as [`Error::Validation`] and nothing is
/// written.
pub async fn save_amounts(
    pool: &SqlitePool,
    actor: &str,
    scope: Scope,
    entry: &ManualEntry,
) -> Result<UpsertOutcome> {
    let amounts = entry.slots();
    let factors = factor::compute(&amounts)?;

    save(
        pool,
        actor,
        UpsertRequest {
            key: entry.key(scope)?,
            slots: SlotWrite::AmountsAndFactors { amounts, factors },
            currency: entry.currency()?,
            provenance: Provenance::Manual,
        },
    )
    .await
}

/// Save directly supplied factors, leaving stored amounts alone
pub async fn save_factors(
    pool: &SqlitePool,
    actor: &str,
    scope: Scope,
    entry: &ManualEntry,
) -> Result<UpsertOutcome> {
    let factors = entry.slots();
    factor::validate_factor_sum(&factors)?;

    save(
        pool,
        actor,
        UpsertRequest {
            key: entry.key(scope)?,
            slots: SlotWrite::FactorsOnly { factors },
            currency: entry.currency()?,
            provenance: Provenance::Manual,
        },
    )
    .await
}

async fn save(pool: &SqlitePool, actor: &str, request: UpsertRequest) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;

    let outcome = qualifications::upsert(&mut *tx, &request, actor).await?;
    let action = if outcome.created {
        AuditAction::ManualCreate
    } else {
        AuditAction::ManualUpdate
    };

    audit::append(
        &mut *tx,
        NewAuditEntry {
            actor,
            action,
            qualification_guid: Some(outcome.guid),
            details: request.key.to_string(),
        },
    )
    .await?;

    tx.commit().await?;

    info!(key = %request.key, action = action.as_str(), "Manual entry saved");
    Ok(outcome)
}

/// Delete a record owned by `scope`
///
/// Records of other scopes (including the baseline, for tenant callers) are
/// reported as [`Error::NotFound`].
pub async fn delete_qualification(
    pool: &SqlitePool,
    actor: &str,
    scope: Scope,
    guid: Uuid,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let record = qualifications::get_by_guid(&mut *tx, guid)
        .await?
        .filter(|record| record.key.scope == scope)
        .ok_or_else(|| Error::NotFound(format!("qualification {}", guid)))?;

    audit::append(
        &mut *tx,
        NewAuditEntry {
            actor,
            action: AuditAction::Delete,
            qualification_guid: Some(guid),
            details: record.key.to_string(),
        },
    )
    .await?;

    qualifications::delete(&mut *tx, guid, scope).await?;
    tx.commit().await?;

    info!(key = %record.key, "Qualification deleted");
    Ok(())
}
