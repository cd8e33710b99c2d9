//! Transform collaborators: the black boxes a recording passes through.
//!
//! Transcription, drafting/coding, and EHR sync are external engines.
//! This module defines the boundary types, the traits the server drives
//! them through, and the completion message they deliver back to the
//! tracker. Engines never mutate pipeline state directly.

pub mod runner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Recording, Stage};

pub use runner::TransformRunner;

/// Raw transcription output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub recording_id: Uuid,
    pub text: String,
    pub language: String,
    pub confidence: Option<f32>,
}

/// A structured clinical note in SOAP form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoapNote {
    pub subjective: String,
    pub objective: String,
    pub assessment: String,
    pub plan: String,
}

/// A suggested billing/diagnosis code with model confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSuggestion {
    pub code: String,
    pub description: String,
    pub confidence: f32,
}

/// Draft note produced by the drafting/coding engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: Uuid,
    pub recording_id: Uuid,
    pub soap: SoapNote,
    #[serde(default)]
    pub icd_codes: Vec<CodeSuggestion>,
    #[serde(default)]
    pub rx_codes: Vec<CodeSuggestion>,
}

/// Receipt from the EHR collaborator after a successful sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EhrReceipt {
    pub recording_id: Uuid,
    pub note_id: String,
}

/// Transform failure, pre-classified by the engine boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct TransformError {
    pub reason: String,
    /// Whether another attempt could succeed
    pub retriable: bool,
}

impl TransformError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: false,
        }
    }
}

/// Speech-to-text engine boundary.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    async fn transcribe(
        &self,
        recording: &Recording,
        audio: &[u8],
    ) -> Result<Transcript, TransformError>;
}

/// Drafting/coding engine boundary: transcript text in, SOAP plus code
/// suggestions out.
#[async_trait]
pub trait DraftingEngine: Send + Sync {
    async fn draft(&self, transcript: &Transcript) -> Result<Draft, TransformError>;
}

/// EHR sync collaborator boundary.
#[async_trait]
pub trait EhrSync: Send + Sync {
    async fn sync(&self, draft: &Draft) -> Result<EhrReceipt, TransformError>;
}

/// Completion record delivered to the tracker when an engine finishes.
///
/// The expected prior stage and version make duplicate or stale
/// deliveries detectable: a completion whose expectation no longer
/// matches the record is discarded without effect.
#[derive(Debug, Clone)]
pub struct TransformCompletion {
    pub recording_id: Uuid,
    pub expected_prior_stage: Stage,
    pub expected_prior_version: u64,
    pub outcome: TransformOutcome,
}

/// What the engine produced, or why it failed.
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    Transcribed(Transcript),
    Drafted(Draft),
    Synced(EhrReceipt),
    Failed { reason: String },
}

impl TransformOutcome {
    /// Human label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transcribed(_) => "transcribed",
            Self::Drafted(_) => "drafted",
            Self::Synced(_) => "synced",
            Self::Failed { .. } => "failed",
        }
    }
}
