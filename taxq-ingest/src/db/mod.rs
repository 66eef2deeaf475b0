//! Database access for taxq-ingest
//!
//! Schema creation lives in `taxq_common::db`; these modules hold the
//! queries the ingestion paths and the reconciliation view run against it.

pub mod audit;
pub mod brokers;
pub mod qualifications;
