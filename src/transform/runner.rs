//! Drives a recording through its transform stages.
//!
//! The runner is the only caller of the engines. For each recording it
//! starts the next stage through the tracker, invokes the engine under
//! the stage timeout, and reports the outcome back as a completion
//! message. The tracker stays the single owner of record state; the
//! runner never mutates it directly.
//!
//! Once a stage has started there is no cancellation: the engine call
//! ends in a completion or in a timeout-to-failure, nothing else.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{PipelineRecord, RecordHealth, Stage};
use crate::server::store::BlobStore;
use crate::server::tracker::{PipelineTracker, RetryOutcome};

use super::{
    Draft, DraftingEngine, EhrSync, TransformCompletion, TransformError, TransformOutcome,
    Transcript, TranscriptionEngine,
};

/// Executes transform stages for tracked recordings.
pub struct TransformRunner {
    tracker: Arc<PipelineTracker>,
    blobs: Arc<dyn BlobStore>,
    transcriber: Arc<dyn TranscriptionEngine>,
    drafter: Arc<dyn DraftingEngine>,
    ehr: Option<Arc<dyn EhrSync>>,
    stage_timeout: Duration,
}

impl TransformRunner {
    pub fn new(
        tracker: Arc<PipelineTracker>,
        blobs: Arc<dyn BlobStore>,
        transcriber: Arc<dyn TranscriptionEngine>,
        drafter: Arc<dyn DraftingEngine>,
        ehr: Option<Arc<dyn EhrSync>>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            blobs,
            transcriber,
            drafter,
            ehr,
            stage_timeout,
        }
    }

    /// Process one recording until it reaches a terminal state. Failed
    /// stages are retried with backoff within the tracker's budget.
    #[instrument(skip(self))]
    pub async fn process(&self, recording_id: Uuid) -> Result<PipelineRecord> {
        loop {
            let record = self
                .tracker
                .get(recording_id)
                .await?
                .with_context(|| format!("unknown recording {recording_id}"))?;

            if record.is_terminal() {
                info!(state = %record.state_label(), "Processing finished");
                return Ok(record);
            }

            match &record.health {
                RecordHealth::Active => {
                    // Enter the next working stage unless a restart left
                    // us already inside one; either way the engine runs
                    // against the record's current stage and version.
                    let record = if record.stage.is_working() {
                        debug!(stage = %record.stage, "Resuming in-flight stage");
                        record
                    } else {
                        self.tracker.start_work(recording_id).await?
                    };

                    let (outcome, permanent) = self.run_stage(&record).await;
                    self.tracker
                        .apply_completion(TransformCompletion {
                            recording_id,
                            expected_prior_stage: record.stage,
                            expected_prior_version: record.stage_version,
                            outcome,
                        })
                        .await?;

                    if permanent {
                        // Retrying cannot help; give up without burning
                        // the remaining budget.
                        let record = self
                            .tracker
                            .abandon(recording_id, "permanent transform failure".to_string())
                            .await?;
                        return Ok(record);
                    }
                }
                RecordHealth::Failed { .. } => {
                    let attempts = record.attempts_at(record.stage);
                    let delay = self.tracker.retry_policy().jittered_delay(attempts);
                    warn!(
                        stage = %record.stage,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Stage failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;

                    match self.tracker.retry(recording_id).await? {
                        RetryOutcome::Retrying(_) => continue,
                        RetryOutcome::Abandoned(record) => {
                            error!("Retry budget exhausted, record abandoned");
                            return Ok(record);
                        }
                    }
                }
                RecordHealth::Abandoned { .. } => return Ok(record),
            }
        }
    }

    /// Service loop: process each recording id handed off by ingestion.
    pub async fn run(self: Arc<Self>, mut work_rx: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(recording_id) = work_rx.recv().await {
            let runner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = runner.process(recording_id).await {
                    error!(recording_id = %recording_id, error = %e, "Processing failed");
                }
            });
        }
    }

    /// Run the engine for the record's working stage under the timeout.
    /// Returns the outcome and whether a failure was permanent.
    async fn run_stage(&self, record: &PipelineRecord) -> (TransformOutcome, bool) {
        let result = tokio::time::timeout(self.stage_timeout, self.dispatch(record)).await;

        match result {
            Ok(Ok(outcome)) => (outcome, false),
            Ok(Err(e)) => {
                let permanent = !e.retriable;
                (
                    TransformOutcome::Failed { reason: e.reason },
                    permanent,
                )
            }
            Err(_) => (
                TransformOutcome::Failed {
                    reason: format!(
                        "{} timed out after {}s",
                        record.stage,
                        self.stage_timeout.as_secs()
                    ),
                },
                false,
            ),
        }
    }

    async fn dispatch(&self, record: &PipelineRecord) -> Result<TransformOutcome, TransformError> {
        let id = record.recording_id;

        match record.stage {
            Stage::Transcribing => {
                let recording = self
                    .tracker
                    .recording(id)
                    .await
                    .map_err(|e| TransformError::transient(e.to_string()))?
                    .ok_or_else(|| TransformError::permanent("recording metadata missing"))?;

                let audio = self
                    .blobs
                    .get(id)
                    .await
                    .map_err(|e| TransformError::transient(e.to_string()))?;

                let transcript = self.transcriber.transcribe(&recording, &audio).await?;
                Ok(TransformOutcome::Transcribed(transcript))
            }
            Stage::Drafting => {
                let raw = self
                    .tracker
                    .artifact(id, "transcript")
                    .await
                    .map_err(|e| TransformError::transient(e.to_string()))?
                    .ok_or_else(|| TransformError::permanent("transcript artifact missing"))?;
                let transcript: Transcript = serde_json::from_str(&raw)
                    .map_err(|e| TransformError::permanent(format!("corrupt transcript: {e}")))?;

                let draft = self.drafter.draft(&transcript).await?;
                Ok(TransformOutcome::Drafted(draft))
            }
            Stage::SyncingEhr => {
                let ehr = self
                    .ehr
                    .as_ref()
                    .ok_or_else(|| TransformError::permanent("no EHR collaborator configured"))?;

                let raw = self
                    .tracker
                    .artifact(id, "draft")
                    .await
                    .map_err(|e| TransformError::transient(e.to_string()))?
                    .ok_or_else(|| TransformError::permanent("draft artifact missing"))?;
                let draft: Draft = serde_json::from_str(&raw)
                    .map_err(|e| TransformError::permanent(format!("corrupt draft: {e}")))?;

                let receipt = ehr.sync(&draft).await?;
                Ok(TransformOutcome::Synced(receipt))
            }
            stage => Err(TransformError::permanent(format!(
                "dispatch called at non-working stage {stage}"
            ))),
        }
    }
}
