//! Server-side components: ingestion, pipeline status tracking, event
//! fan-out, the audit ledger, and the durable stores behind them.

pub mod audit;
pub mod fanout;
pub mod ingest;
pub mod store;
pub mod tracker;

pub use audit::{AuditFilter, AuditLedger};
pub use fanout::{Identity, SubscriberRegistry, Subscription};
pub use ingest::{IngestError, IngestRequest, IngestionService};
pub use store::{BlobStore, FsBlobStore, RecordStore};
pub use tracker::{PipelineTracker, StatusView, TrackerError};
