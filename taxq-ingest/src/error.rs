//! Error types for taxq-ingest
//!
//! Bulk loads surface exactly one terminal [`IngestError`]; the event loop only
//! returns an error for a fatal [`TransportError`].

use chrono::NaiveDate;
use taxq_common::ValidationError;
use thiserror::Error;

/// Terminal failure of a bulk load; nothing from the file was committed
#[derive(Debug, Error)]
pub enum IngestError {
    /// File could not be read as delimited text with a header row
    #[error("Malformed file: {0}")]
    Malformed(String),

    /// Payment date missing or in an unrecognized layout
    #[error("Row {row}: invalid payment date {raw:?} for instrument {instrument:?}")]
    BadDate {
        row: usize,
        instrument: String,
        raw: String,
    },

    /// Row fails factor validation (sum above 1 or amounts out of range)
    #[error("Row {row}: instrument {instrument} paid {payment_date}: {source}")]
    Invalid {
        row: usize,
        instrument: String,
        payment_date: NaiveDate,
        #[source]
        source: ValidationError,
    },

    /// taxq-common error (database, I/O, ...)
    #[error(transparent)]
    Common(#[from] taxq_common::Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Common(taxq_common::Error::Database(err))
    }
}

/// Failure reported by an event source
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transient problem; the consumer logs it and polls again
    #[error("Recoverable transport error: {0}")]
    Recoverable(String),

    /// The stream ended; the consumer stops cleanly
    #[error("Event stream closed")]
    Closed,

    /// Connection lost for good; the consumer stops with an error
    #[error("Fatal transport error: {0}")]
    Fatal(String),
}

impl From<TransportError> for taxq_common::Error {
    fn from(err: TransportError) -> Self {
        taxq_common::Error::Transport(err.to_string())
    }
}
