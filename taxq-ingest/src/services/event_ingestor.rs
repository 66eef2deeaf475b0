//! Event stream consumer
//!
//! Long-running loop over an [`EventSource`]. Each message is its own unit of
//! work: decode, resolve the broker, upsert the amount, audit, acknowledge.
//! Per-message problems never stop the loop; only a fatal transport error
//! does.
//!
//! Event amounts are stored with factor status PENDING. Factors are derived
//! later by [`crate::services::recalculation`], which also enforces the factor
//! sum bound for these records.

use crate::db::audit::{self, NewAuditEntry};
use crate::db::brokers;
use crate::db::qualifications::{self, EventAmountWrite, UpsertOutcome};
use crate::error::TransportError;
use crate::services::event_source::{EventSource, InboundMessage};
use crate::utils::retry_on_lock;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::fmt;
use std::time::Duration;
use taxq_common::amount;
use taxq_common::config::ConsumerConfig;
use taxq_common::db::{AuditAction, Currency, Market, Scope};
use taxq_common::{time, Error, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a recoverable transport error before polling again
const RECOVERABLE_PAUSE: Duration = Duration::from_millis(100);

/// Consumer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connected,
    Decoding,
    Resolving,
    Upserting,
    Auditing,
}

/// Running totals for one consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub created: u64,
    pub updated: u64,
    /// Undecodable payloads, missing fields, bad dates, unknown markets
    pub discarded: u64,
    pub unknown_tenant: u64,
    /// Left unacknowledged for redelivery
    pub store_failures: u64,
    pub transport_errors: u64,
}

/// Wire shape of an inbound event; unknown fields are ignored
#[derive(Debug, Deserialize)]
struct EventPayload {
    broker_code: Option<String>,
    instrument: Option<String>,
    date: Option<String>,
    year: Option<i32>,
    amount: Option<serde_json::Value>,
    market: Option<String>,
    currency: Option<String>,
}

/// Decoded, well-formed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualificationEvent {
    pub broker_code: String,
    pub market: Option<Market>,
    pub instrument: String,
    pub payment_date: NaiveDate,
    pub exercise_year: i32,
    pub amount: Decimal,
    pub currency: Currency,
}

/// Why a message was dropped without touching the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    Malformed(String),
    MissingField(&'static str),
    BadDate(String),
    UnknownMarket(String),
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::Malformed(reason) => write!(f, "malformed payload: {}", reason),
            DiscardReason::MissingField(field) => write!(f, "missing required field {:?}", field),
            DiscardReason::BadDate(raw) => write!(f, "unparsable date {:?}", raw),
            DiscardReason::UnknownMarket(raw) => write!(f, "unknown market {:?}", raw),
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> std::result::Result<String, DiscardReason> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(DiscardReason::MissingField(field))
}

/// Decode a raw payload into an event
pub fn decode_event(payload: &[u8]) -> std::result::Result<QualificationEvent, DiscardReason> {
    let raw: EventPayload =
        serde_json::from_slice(payload).map_err(|e| DiscardReason::Malformed(e.to_string()))?;

    let broker_code = required(raw.broker_code, "broker_code")?;
    let instrument = required(raw.instrument, "instrument")?;
    let date = required(raw.date, "date")?;
    let exercise_year = raw.year.ok_or(DiscardReason::MissingField("year"))?;
    let amount = raw
        .amount
        .filter(|value| !value.is_null())
        .map(|value| amount::normalize_json(&value))
        .ok_or(DiscardReason::MissingField("amount"))?;

    let payment_date =
        time::parse_payment_date(&date).map_err(|_| DiscardReason::BadDate(date.clone()))?;

    let market = raw
        .market
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|code| Market::from_code(code).ok_or_else(|| DiscardReason::UnknownMarket(code.to_string())))
        .transpose()?;

    let currency = match raw.currency.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        None => Currency::default(),
        Some(code) => Currency::from_code(code).unwrap_or_else(|| {
            warn!(currency = code, "Unknown event currency, using CLP");
            Currency::default()
        }),
    };

    Ok(QualificationEvent {
        broker_code,
        market,
        instrument,
        payment_date,
        exercise_year,
        amount,
        currency,
    })
}

/// What happened to one message; decides acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Applied { created: bool },
    Discarded,
    StoreFailed,
}

impl MessageOutcome {
    fn should_ack(&self) -> bool {
        !matches!(self, MessageOutcome::StoreFailed)
    }
}

/// Single-consumer event loop
pub struct EventIngestor {
    pool: SqlitePool,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    stats: ConsumerStats,
}

impl EventIngestor {
    pub fn new(pool: SqlitePool, config: ConsumerConfig) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            pool,
            config,
            state,
            stats: ConsumerStats::default(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Consumer state transition");
        }
    }

    /// Consume until `cancel` fires or the source closes
    ///
    /// Cancellation is checked between messages; a message already being
    /// processed is finished first. Returns the final counters, or the
    /// transport error that ended the loop.
    pub async fn run<S>(&mut self, source: &mut S, cancel: CancellationToken) -> Result<ConsumerStats>
    where
        S: EventSource + ?Sized,
    {
        let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);
        self.transition(ConsumerState::Connected);
        info!(actor = %self.config.actor, "Event consumer started");

        let result = loop {
            if cancel.is_cancelled() {
                info!("Stop requested, leaving event loop");
                break Ok(());
            }

            let message = match source.poll(poll_timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(TransportError::Recoverable(reason)) => {
                    warn!(%reason, "Transport hiccup, polling again");
                    self.stats.transport_errors += 1;
                    tokio::time::sleep(RECOVERABLE_PAUSE).await;
                    continue;
                }
                Err(TransportError::Closed) => {
                    info!("Event stream closed");
                    break Ok(());
                }
                Err(err @ TransportError::Fatal(_)) => {
                    error!(error = %err, "Event transport failed");
                    break Err(err);
                }
            };

            self.stats.received += 1;
            let outcome = self.handle_message(&message).await;
            self.transition(ConsumerState::Connected);

            if !outcome.should_ack() {
                continue;
            }
            match source.ack(&message).await {
                Ok(()) => {}
                Err(TransportError::Recoverable(reason)) => {
                    warn!(offset = message.offset, %reason, "Acknowledgement failed; message may be redelivered");
                    self.stats.transport_errors += 1;
                }
                Err(TransportError::Closed) => {
                    info!("Event stream closed during acknowledgement");
                    break Ok(());
                }
                Err(err @ TransportError::Fatal(_)) => {
                    error!(error = %err, "Event transport failed");
                    break Err(err);
                }
            }
        };

        self.transition(ConsumerState::Idle);
        info!(
            received = self.stats.received,
            created = self.stats.created,
            updated = self.stats.updated,
            discarded = self.stats.discarded,
            unknown_tenant = self.stats.unknown_tenant,
            store_failures = self.stats.store_failures,
            "Event consumer stopped"
        );

        result.map(|()| self.stats).map_err(Error::from)
    }

    /// Process one message end to end
    pub async fn handle_message(&mut self, message: &InboundMessage) -> MessageOutcome {
        self.transition(ConsumerState::Decoding);
        let event = match decode_event(&message.payload) {
            Ok(event) => event,
            Err(reason) => {
                warn!(offset = message.offset, %reason, "Discarding event");
                self.stats.discarded += 1;
                return MessageOutcome::Discarded;
            }
        };

        self.transition(ConsumerState::Resolving);
        let broker = match brokers::resolve_broker(&self.pool, &event.broker_code).await {
            Ok(broker) => broker,
            Err(Error::NotFound(_)) => {
                warn!(
                    offset = message.offset,
                    broker_code = %event.broker_code,
                    "Discarding event for unknown broker"
                );
                self.stats.unknown_tenant += 1;
                return MessageOutcome::Discarded;
            }
            Err(err) => {
                error!(offset = message.offset, error = %err, "Broker lookup failed; leaving event unacknowledged");
                self.stats.store_failures += 1;
                return MessageOutcome::StoreFailed;
            }
        };

        self.transition(ConsumerState::Upserting);
        let write = EventAmountWrite {
            scope: Scope::from(&broker),
            market: event.market.unwrap_or(self.config.default_market),
            instrument: event.instrument.clone(),
            payment_date: event.payment_date,
            exercise_year: event.exercise_year,
            amount: event.amount,
            currency: event.currency,
        };

        let applied = retry_on_lock("event upsert", self.config.max_lock_wait_ms, || {
            apply_event(&self.pool, &self.state, &write, &self.config.actor, message.offset)
        })
        .await;

        match applied {
            Ok(outcome) => {
                if outcome.created {
                    self.stats.created += 1;
                } else {
                    self.stats.updated += 1;
                }
                info!(
                    offset = message.offset,
                    broker = %broker.code,
                    instrument = %write.instrument,
                    payment_date = %write.payment_date,
                    created = outcome.created,
                    "Event applied"
                );
                MessageOutcome::Applied {
                    created: outcome.created,
                }
            }
            Err(err) => {
                error!(
                    offset = message.offset,
                    instrument = %write.instrument,
                    error = %err,
                    "Failed to store event; leaving it unacknowledged"
                );
                self.stats.store_failures += 1;
                MessageOutcome::StoreFailed
            }
        }
    }
}

/// Upsert and audit in one transaction
async fn apply_event(
    pool: &SqlitePool,
    state: &watch::Sender<ConsumerState>,
    write: &EventAmountWrite,
    actor: &str,
    offset: u64,
) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;

    let outcome = qualifications::upsert_event_amount(&mut *tx, write, actor).await?;

    state.send_replace(ConsumerState::Auditing);
    let action = if outcome.created {
        AuditAction::EventCreated
    } else {
        AuditAction::EventUpdated
    };
    audit::append(
        &mut *tx,
        NewAuditEntry {
            actor,
            action,
            qualification_guid: Some(outcome.guid),
            details: format!(
                "offset {}: {} {} paid {} year {} amount {} {}",
                offset,
                write.market,
                write.instrument,
                write.payment_date,
                write.exercise_year,
                write.amount,
                write.currency.as_str()
            ),
        },
    )
    .await?;

    tx.commit().await?;
    Ok(outcome)
}
