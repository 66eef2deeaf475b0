//! Reconciliation view: baseline records overlaid with a broker's own
//!
//! A broker sees every exchange-wide ("bolsa") record plus its own records,
//! with its own version winning wherever both exist for the same market,
//! instrument, payment date and exercise year. Read-only.

use crate::db::{brokers, qualifications};
use serde::Serialize;
use sqlx::SqlitePool;
use std::cmp::Ordering;
use std::collections::HashMap;
use taxq_common::db::{
    Broker, Currency, FactorStatus, Market, MergeKey, Provenance, Qualification, Scope,
};
use taxq_common::{AmountSlots, FactorSlots, Result};
use tracing::{debug, warn};

/// Who is asking; decides which records are visible
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viewer {
    /// Sees every record of every scope, unmerged
    Superuser,
    /// Sees baseline records overridden by this broker's records
    Tenant(Broker),
    /// Logged in without a broker link; sees nothing
    Unassigned,
}

/// One row of the reconciled listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualificationView {
    pub market: Market,
    pub instrument: String,
    pub payment_date: chrono::NaiveDate,
    pub exercise_year: i32,
    pub amounts: AmountSlots,
    pub factors: FactorSlots,
    pub provenance: Provenance,
    pub scope: Scope,
    pub currency: Currency,
    pub factor_status: FactorStatus,
}

impl From<Qualification> for QualificationView {
    fn from(record: Qualification) -> Self {
        Self {
            market: record.key.market,
            instrument: record.key.instrument,
            payment_date: record.key.payment_date,
            exercise_year: record.key.exercise_year,
            amounts: record.amounts,
            factors: record.factors,
            provenance: record.provenance,
            scope: record.key.scope,
            currency: record.currency,
            factor_status: record.factor_status,
        }
    }
}

/// Map a logged-in user to a [`Viewer`]
///
/// A non-superuser without a broker link resolves to [`Viewer::Unassigned`].
pub async fn resolve_viewer(pool: &SqlitePool, username: &str, is_superuser: bool) -> Result<Viewer> {
    if is_superuser {
        return Ok(Viewer::Superuser);
    }

    match brokers::broker_for_user(pool, username).await? {
        Some(broker) => Ok(Viewer::Tenant(broker)),
        None => {
            warn!(username, "User has no broker assigned; showing no records");
            Ok(Viewer::Unassigned)
        }
    }
}

/// Records visible to `viewer`, newest payment date first
pub async fn list_for(pool: &SqlitePool, viewer: &Viewer) -> Result<Vec<QualificationView>> {
    let mut records = match viewer {
        Viewer::Superuser => qualifications::list_all(pool).await?,
        Viewer::Tenant(broker) => {
            let baseline = qualifications::list_by_scope(pool, Scope::Baseline).await?;
            let own = qualifications::list_by_scope(pool, Scope::from(broker)).await?;
            debug!(
                broker = %broker.code,
                baseline = baseline.len(),
                own = own.len(),
                "Merging baseline and broker records"
            );
            merge(baseline, own)
        }
        Viewer::Unassigned => Vec::new(),
    };

    records.sort_by(display_order);
    Ok(records.into_iter().map(QualificationView::from).collect())
}

/// Overlay `overrides` on `baseline` by merge key; overrides win
pub fn merge(baseline: Vec<Qualification>, overrides: Vec<Qualification>) -> Vec<Qualification> {
    let mut merged: HashMap<MergeKey, Qualification> =
        HashMap::with_capacity(baseline.len() + overrides.len());

    for record in baseline.into_iter().chain(overrides) {
        merged.insert(record.key.merge_key(), record);
    }

    merged.into_values().collect()
}

fn display_order(a: &Qualification, b: &Qualification) -> Ordering {
    b.key
        .payment_date
        .cmp(&a.key.payment_date)
        .then_with(|| a.key.market.cmp(&b.key.market))
        .then_with(|| a.key.instrument.cmp(&b.key.instrument))
        .then_with(|| a.key.exercise_year.cmp(&b.key.exercise_year))
        .then_with(|| b.key.scope.is_baseline().cmp(&a.key.scope.is_baseline()))
        .then_with(|| a.key.scope.storage_key().cmp(&b.key.scope.storage_key()))
}
