//! Factor recalculation for event-sourced records
//!
//! Second phase of event ingestion. Records written by the event consumer
//! carry fresh amounts with factor status PENDING; this pass derives their
//! factors and enforces the factor sum bound. Records whose amounts break the
//! bound keep their previous factors and are marked REJECTED.

use crate::db::audit::{self, NewAuditEntry};
use crate::db::qualifications;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Duration;
use taxq_common::db::{AuditAction, FactorStatus};
use taxq_common::{factor, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecalcSummary {
    pub recalculated: usize,
    pub rejected: usize,
}

/// Settle every PENDING record
///
/// Each record is settled in its own transaction. A record that changed since
/// it was listed is left PENDING for the next pass.
pub async fn recalculate_pending(pool: &SqlitePool, actor: &str) -> Result<RecalcSummary> {
    let pending = qualifications::list_by_factor_status(pool, FactorStatus::Pending).await?;
    let mut summary = RecalcSummary::default();

    for record in pending {
        let computed = factor::compute(&record.amounts);
        let mut tx = pool.begin().await?;

        let (factors, status, action, details) = match &computed {
            Ok(factors) => (
                Some(factors),
                FactorStatus::Current,
                AuditAction::Recalculated,
                record.key.to_string(),
            ),
            Err(err) => (
                None,
                FactorStatus::Rejected,
                AuditAction::RecalculationRejected,
                format!("{}: {}", record.key, err),
            ),
        };

        let settled = qualifications::settle_pending(
            &mut *tx,
            record.guid,
            &record.amounts,
            factors,
            status,
            actor,
        )
        .await?;
        if !settled {
            debug!(key = %record.key, "Record changed during recalculation; left pending");
            continue;
        }

        audit::append(
            &mut *tx,
            NewAuditEntry {
                actor,
                action,
                qualification_guid: Some(record.guid),
                details,
            },
        )
        .await?;
        tx.commit().await?;

        match status {
            FactorStatus::Rejected => {
                warn!(key = %record.key, "Event amounts fail factor validation; record rejected");
                summary.rejected += 1;
            }
            _ => summary.recalculated += 1,
        }
    }

    if summary != RecalcSummary::default() {
        info!(
            recalculated = summary.recalculated,
            rejected = summary.rejected,
            "Recalculation pass finished"
        );
    }
    Ok(summary)
}

/// Run [`recalculate_pending`] every `interval` until `cancel` fires
pub async fn run_periodic(pool: SqlitePool, actor: String, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = recalculate_pending(&pool, &actor).await {
                    error!(error = %err, "Recalculation pass failed");
                }
            }
        }
    }

    debug!("Recalculation task stopped");
}
