//! # TAXQ Common Library
//!
//! Shared code for the tax qualification services including:
//! - Error taxonomy shared by every ingestion path
//! - Configuration loading and root folder resolution
//! - Amount normalization and the amount → factor calculation
//! - Database initialization, schema versioning and models
//! - Date parsing utilities

pub mod amount;
pub mod config;
pub mod db;
pub mod error;
pub mod factor;
pub mod time;

pub use amount::{AmountSlots, FactorSlots, Slots, SLOT_COUNT};
pub use error::{Error, Result, ValidationError};
