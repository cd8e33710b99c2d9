//! Transport adapters between the device and the ingestion endpoint.
//!
//! The synchronizer only sees the `IngestClient` trait; the HTTP
//! implementation lives behind it so tests can inject failing or
//! recording mocks.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{IngestAck, Recording};
use crate::error::{Classify, ErrorClass};

// Re-export the HTTP client
pub use http::HttpIngestClient;

/// Upload failure, already classified for the retry machinery.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// Network or server-side trouble; the backoff schedule applies.
    #[error("transient upload failure: {0}")]
    Transient(String),

    /// The server rejected the payload; retrying cannot help.
    #[error("upload rejected: {0}")]
    Permanent(String),
}

impl Classify for UploadError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// Client for delivering a recording to the ingestion endpoint.
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Human-readable client name
    fn name(&self) -> &str;

    /// Upload one recording. The recording id doubles as the idempotency
    /// key; re-uploading an accepted recording must return the existing
    /// acknowledgement.
    async fn upload(&self, recording: &Recording, audio: &[u8]) -> Result<IngestAck, UploadError>;
}
