//! Common error types for TAXQ

use rust_decimal::Decimal;
use thiserror::Error;

/// Common result type for TAXQ operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across TAXQ services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found (unknown broker code, foreign record, ...)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed date, number or delimited text
    #[error("Parse error: {0}")]
    Parse(String),

    /// Business invariant violated by a candidate write
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Message transport decode or connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Invariant violations detected before anything is persisted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Sum of factors 8 through 16 (rounded to 4 places) is above 1
    #[error("sum of factors 8 to 16 is {sum}, which exceeds 1")]
    FactorSumExceeded { sum: Decimal },

    /// Deriving `factor` needs a value outside the representable decimal range
    #[error("factor {factor} cannot be derived: amounts are out of range")]
    AmountOverflow { factor: usize },

    /// Factors 8 through 16 add up to a value outside the representable decimal range
    #[error("sum of factors 8 to 16 is out of range")]
    FactorSumOverflow,
}

impl Error {
    /// True when SQLite rejected the operation because another writer holds the lock
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => {
                let message = db_err.to_string();
                message.contains("database is locked") || message.contains("database table is locked")
            }
            _ => false,
        }
    }
}
