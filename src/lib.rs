//! scribeflow - offline-first capture and processing pipeline for
//! clinical dictation
//!
//! A recording captured on a device must never be lost and never go
//! unaudited. The crate is built around two durable append-only logs:
//! - the device-side capture queue, which holds a recording until the
//!   server has durably acknowledged it
//! - the server-side transition log per recording, which versions every
//!   step through transcription, drafting and EHR sync
//!
//! # Architecture
//!
//! Device: capture queue → upload synchronizer → ingestion endpoint,
//! gated by a connectivity signal and an exponential backoff schedule.
//! Server: ingestion → pipeline tracker → transform runner, with stage
//! transitions fanned out to authorized subscribers and every mutation
//! written through the audit ledger before it commits.
//!
//! # Modules
//!
//! - `capture`: device-resident queue, watcher, synchronizer
//! - `server`: ingestion, status tracker, fan-out, audit ledger
//! - `transform`: black-box engine boundaries and the stage runner
//! - `adapters`: ingest transport (trait + HTTP client)
//! - `domain`: shared data structures
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Queue a finished capture for upload
//! scribeflow capture visit.m4a --owner <uuid> --clinic <uuid>
//!
//! # Drain the queue once connectivity is back
//! scribeflow sync --once
//!
//! # Check a recording's pipeline status
//! scribeflow status <recording-id>
//! ```

pub mod adapters;
pub mod capture;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod server;
pub mod transform;

// Re-export main types at crate root for convenience
pub use capture::{CaptureQueue, Connectivity, UploadSynchronizer};
pub use config::{Config, RetryPolicy};
pub use domain::{PipelineRecord, Recording, Stage, StatusEvent};
pub use error::{Classify, ErrorClass};
pub use server::{AuditLedger, IngestionService, PipelineTracker, SubscriberRegistry};
pub use transform::TransformRunner;
