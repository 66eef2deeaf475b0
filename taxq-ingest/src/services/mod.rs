//! Ingestion and reconciliation services

pub mod bulk_ingestor;
pub mod event_ingestor;
pub mod event_source;
pub mod manual_entry;
pub mod recalculation;
pub mod reconciliation;
pub mod tabular;

pub use bulk_ingestor::{ingest, BulkLoadSummary, BulkMode};
pub use event_ingestor::{ConsumerState, ConsumerStats, EventIngestor, MessageOutcome};
pub use event_source::{ChannelSource, EventSource, InboundMessage, JsonLinesSource};
pub use manual_entry::{delete_qualification, save_amounts, save_factors, ManualEntry};
pub use recalculation::{recalculate_pending, RecalcSummary};
pub use reconciliation::{list_for, resolve_viewer, QualificationView, Viewer};
