//! Database models

use crate::amount::{AmountSlots, FactorSlots};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Storage marker for exchange-wide ("bolsa") records
pub const BASELINE_SCOPE_KEY: &str = "bolsa";

/// Broker (tenant) owning non-baseline records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    pub guid: Uuid,
    pub code: String,
    pub name: String,
}

/// Owner of a qualification: the exchange-wide baseline or one broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Baseline,
    Tenant(Uuid),
}

impl Scope {
    /// Value stored in the `scope` column (part of the unique identity)
    pub fn storage_key(&self) -> String {
        match self {
            Scope::Baseline => BASELINE_SCOPE_KEY.to_string(),
            Scope::Tenant(guid) => guid.to_string(),
        }
    }

    /// Value stored in the nullable `broker_guid` foreign key
    pub fn broker_guid(&self) -> Option<Uuid> {
        match self {
            Scope::Baseline => None,
            Scope::Tenant(guid) => Some(*guid),
        }
    }

    pub fn from_storage_key(key: &str) -> Result<Self> {
        if key == BASELINE_SCOPE_KEY {
            return Ok(Scope::Baseline);
        }
        Uuid::parse_str(key)
            .map(Scope::Tenant)
            .map_err(|e| Error::Internal(format!("Corrupt scope {:?}: {}", key, e)))
    }

    pub fn is_baseline(&self) -> bool {
        matches!(self, Scope::Baseline)
    }
}

impl From<&Broker> for Scope {
    fn from(broker: &Broker) -> Self {
        Scope::Tenant(broker.guid)
    }
}

/// Market segment a qualification belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    #[default]
    Acciones,
    Cfi,
    FondosMutuos,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Acciones => "acciones",
            Market::Cfi => "cfi",
            Market::FondosMutuos => "fondos_mutuos",
        }
    }

    /// Case-insensitive lookup of a market code
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "acciones" => Some(Market::Acciones),
            "cfi" => Some(Market::Cfi),
            "fondos_mutuos" => Some(Market::FondosMutuos),
            _ => None,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of a qualification record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualificationKey {
    pub scope: Scope,
    pub market: Market,
    pub instrument: String,
    pub payment_date: NaiveDate,
    pub exercise_year: i32,
}

/// Identity without its owner, used to line up baseline and tenant records
pub type MergeKey = (Market, String, NaiveDate, i32);

impl QualificationKey {
    pub fn merge_key(&self) -> MergeKey {
        (
            self.market,
            self.instrument.clone(),
            self.payment_date,
            self.exercise_year,
        )
    }
}

impl fmt::Display for QualificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{} ({})",
            self.market,
            self.instrument,
            self.payment_date,
            self.exercise_year,
            self.scope.storage_key()
        )
    }
}

/// Ingestion path that produced or last touched a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    Manual,
    BulkAmounts,
    BulkFactors,
    Event,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Manual => "MANUAL",
            Provenance::BulkAmounts => "BULK_AMOUNTS",
            Provenance::BulkFactors => "BULK_FACTORS",
            Provenance::Event => "EVENT",
        }
    }
}

impl FromStr for Provenance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MANUAL" => Ok(Provenance::Manual),
            "BULK_AMOUNTS" => Ok(Provenance::BulkAmounts),
            "BULK_FACTORS" => Ok(Provenance::BulkFactors),
            "EVENT" => Ok(Provenance::Event),
            other => Err(Error::Internal(format!("Unknown provenance {:?}", other))),
        }
    }
}

/// Whether the stored factors reflect the stored amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactorStatus {
    /// Factors were computed or supplied by the last write
    Current,
    /// New amounts arrived from the event stream; factors await recalculation
    Pending,
    /// Recalculation found the stored amounts break the factor sum bound
    Rejected,
}

impl FactorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorStatus::Current => "CURRENT",
            FactorStatus::Pending => "PENDING",
            FactorStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for FactorStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CURRENT" => Ok(FactorStatus::Current),
            "PENDING" => Ok(FactorStatus::Pending),
            "REJECTED" => Ok(FactorStatus::Rejected),
            other => Err(Error::Internal(format!("Unknown factor status {:?}", other))),
        }
    }
}

/// Settlement currency of a qualification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Clp,
    Cop,
    Pen,
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Clp => "CLP",
            Currency::Cop => "COP",
            Currency::Pen => "PEN",
            Currency::Usd => "USD",
        }
    }

    /// Case-insensitive lookup of an ISO code
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "CLP" => Some(Currency::Clp),
            "COP" => Some(Currency::Cop),
            "PEN" => Some(Currency::Pen),
            "USD" => Some(Currency::Usd),
            _ => None,
        }
    }
}

/// A persisted qualification record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualification {
    pub guid: Uuid,
    pub key: QualificationKey,
    pub amounts: AmountSlots,
    pub factors: FactorSlots,
    pub currency: Currency,
    pub provenance: Provenance,
    pub factor_status: FactorStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Audit action kinds written by the ingestion paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ManualCreate,
    ManualUpdate,
    Delete,
    BulkLoadAmounts,
    BulkLoadFactors,
    BulkLoad,
    EventCreated,
    EventUpdated,
    Recalculated,
    RecalculationRejected,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ManualCreate => "MANUAL_CREATE",
            AuditAction::ManualUpdate => "MANUAL_UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::BulkLoadAmounts => "BULK_LOAD_AMOUNTS",
            AuditAction::BulkLoadFactors => "BULK_LOAD_FACTORS",
            AuditAction::BulkLoad => "BULK_LOAD",
            AuditAction::EventCreated => "EVENT_CREATED",
            AuditAction::EventUpdated => "EVENT_UPDATED",
            AuditAction::Recalculated => "RECALCULATED",
            AuditAction::RecalculationRejected => "RECALCULATION_REJECTED",
        }
    }
}

/// A persisted audit log entry (read-only to callers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub guid: Uuid,
    pub actor: String,
    pub action: String,
    pub qualification_guid: Option<Uuid>,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}
