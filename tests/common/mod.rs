//! Shared wiring for integration tests: an in-process server with stub
//! transform engines, plus scripted failure variants.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use scribeflow::config::RetryPolicy;
use scribeflow::domain::Recording;
use scribeflow::server::fanout::SubscriberRegistry;
use scribeflow::server::store::{FsBlobStore, RecordStore};
use scribeflow::server::{AuditLedger, IngestionService, PipelineTracker};
use scribeflow::transform::{
    Draft, DraftingEngine, EhrReceipt, EhrSync, SoapNote, TransformError, TransformRunner,
    Transcript, TranscriptionEngine,
};

/// Transcriber that always succeeds.
pub struct StubTranscriber;

#[async_trait]
impl TranscriptionEngine for StubTranscriber {
    async fn transcribe(
        &self,
        recording: &Recording,
        _audio: &[u8],
    ) -> Result<Transcript, TransformError> {
        Ok(Transcript {
            recording_id: recording.id,
            text: "patient reports intermittent chest pain for two days".to_string(),
            language: "en".to_string(),
            confidence: Some(0.91),
        })
    }
}

/// Transcriber that fails transiently `failures` times, then succeeds.
pub struct FlakyTranscriber {
    remaining: AtomicU32,
}

impl FlakyTranscriber {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TranscriptionEngine for FlakyTranscriber {
    async fn transcribe(
        &self,
        recording: &Recording,
        audio: &[u8],
    ) -> Result<Transcript, TransformError> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransformError::transient("speech engine unavailable"));
        }
        StubTranscriber.transcribe(recording, audio).await
    }
}

/// Drafter that always succeeds.
pub struct StubDrafter;

#[async_trait]
impl DraftingEngine for StubDrafter {
    async fn draft(&self, transcript: &Transcript) -> Result<Draft, TransformError> {
        Ok(Draft {
            id: Uuid::new_v4(),
            recording_id: transcript.recording_id,
            soap: SoapNote {
                subjective: transcript.text.clone(),
                objective: "vitals stable".to_string(),
                assessment: "non-cardiac chest pain, likely musculoskeletal".to_string(),
                plan: "NSAIDs, follow-up in one week".to_string(),
            },
            icd_codes: vec![],
            rx_codes: vec![],
        })
    }
}

/// Drafter that always fails transiently.
pub struct BrokenDrafter;

#[async_trait]
impl DraftingEngine for BrokenDrafter {
    async fn draft(&self, _transcript: &Transcript) -> Result<Draft, TransformError> {
        Err(TransformError::transient("drafting engine overloaded"))
    }
}

/// EHR collaborator that always succeeds.
pub struct StubEhr;

#[async_trait]
impl EhrSync for StubEhr {
    async fn sync(&self, draft: &Draft) -> Result<EhrReceipt, TransformError> {
        Ok(EhrReceipt {
            recording_id: draft.recording_id,
            note_id: format!("obs-{}", draft.id),
        })
    }
}

/// An in-process server wired for tests.
pub struct TestServer {
    pub tracker: Arc<PipelineTracker>,
    pub fanout: Arc<SubscriberRegistry>,
    pub audit: Arc<AuditLedger>,
    pub service: Arc<IngestionService>,
    pub work_rx: mpsc::UnboundedReceiver<Uuid>,
    pub blobs: Arc<FsBlobStore>,
}

impl TestServer {
    /// Wire a server with the default stub engines.
    pub async fn start(temp: &TempDir) -> Self {
        Self::start_with(temp, RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        })
        .await
    }

    pub async fn start_with(temp: &TempDir, stage_retry: RetryPolicy) -> Self {
        let store = RecordStore::open(temp.path().join("records")).await.unwrap();
        let fanout = SubscriberRegistry::new(64);
        let audit = AuditLedger::open(&temp.path().join("audit.db")).unwrap();
        let tracker = Arc::new(PipelineTracker::new(
            store,
            fanout.clone(),
            audit.clone(),
            stage_retry,
        ));
        let blobs = Arc::new(FsBlobStore::open(temp.path().join("blobs")).await.unwrap());
        let (service, work_rx) = IngestionService::new(tracker.clone(), blobs.clone(), audit.clone());

        Self {
            tracker,
            fanout,
            audit,
            service: Arc::new(service),
            work_rx,
            blobs,
        }
    }

    /// A runner over this server's tracker with the given engines.
    pub fn runner(
        &self,
        transcriber: Arc<dyn TranscriptionEngine>,
        drafter: Arc<dyn DraftingEngine>,
        ehr: Option<Arc<dyn EhrSync>>,
    ) -> TransformRunner {
        TransformRunner::new(
            self.tracker.clone(),
            self.blobs.clone(),
            transcriber,
            drafter,
            ehr,
            Duration::from_secs(5),
        )
    }

    /// A runner with the always-succeeding stub engines.
    pub fn stub_runner(&self) -> TransformRunner {
        self.runner(Arc::new(StubTranscriber), Arc::new(StubDrafter), Some(Arc::new(StubEhr)))
    }
}

/// A fresh recording with its payload.
pub fn sample_recording(owner: Uuid, clinic: Uuid) -> (Recording, Vec<u8>) {
    let audio = format!("aac-frames-{}", Uuid::new_v4()).into_bytes();
    let recording = Recording::capture(owner, clinic, &audio, 4200);
    (recording, audio)
}
