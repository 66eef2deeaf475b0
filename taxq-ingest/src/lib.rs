//! taxq-ingest library interface
//!
//! Ingestion paths (bulk files, manual entry, event stream), the factor
//! recalculation pass and the reconciliation view over the shared database.

pub mod db;
pub mod error;
pub mod services;
pub mod utils;

pub use crate::error::{IngestError, TransportError};
