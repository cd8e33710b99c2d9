//! Pipeline status tracker: sole owner of pipeline record state.
//!
//! Transform engines report completions as messages; the tracker
//! validates them against the record's current stage and version, so
//! stale or duplicate deliveries are discarded instead of applied.
//! Every persisted transition bumps the stage version, and persistence
//! strictly precedes notification: a crash between the two is recovered
//! by replaying unnotified transitions on restart.
//!
//! Mutations are audited before they commit, and per-record locking
//! keeps concurrent transitions for the same recording serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::domain::{
    AuditEntry, EventScope, PipelineRecord, RecordHealth, Recording, Stage, StatusEvent,
    Transition, TransitionKind,
};
use crate::error::{Classify, ErrorClass};
use crate::server::audit::{AuditError, AuditLedger};
use crate::server::fanout::SubscriberRegistry;
use crate::server::store::RecordStore;
use crate::transform::{TransformCompletion, TransformOutcome};

/// Errors from the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("pipeline record not found: {0}")]
    NotFound(Uuid),

    #[error("illegal transition for {recording_id}: {detail}")]
    Illegal { recording_id: Uuid, detail: String },

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("record storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl Classify for TrackerError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) | Self::Illegal { .. } => ErrorClass::Permanent,
            Self::Audit(e) => e.class(),
            Self::Storage(_) => ErrorClass::Transient,
        }
    }
}

/// Result of creating a record.
#[derive(Debug, Clone)]
pub enum Created {
    New(PipelineRecord),
    /// The recording was already known; nothing was written.
    Existing(PipelineRecord),
}

impl Created {
    pub fn record(&self) -> &PipelineRecord {
        match self {
            Self::New(r) | Self::Existing(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Result of applying a completion message.
#[derive(Debug, Clone)]
pub enum Applied {
    Advanced(PipelineRecord),
    FailedStage(PipelineRecord),
    /// Expectation mismatch: duplicate or stale delivery, discarded.
    Stale,
}

/// Result of a retry request.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Retrying(PipelineRecord),
    Abandoned(PipelineRecord),
}

/// Answer to the status query.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub recording_id: Uuid,
    pub stage: String,
    pub stage_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// What restart recovery found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub records: usize,
    /// Transitions persisted but unnotified before the crash, re-published
    pub replayed: usize,
    /// Non-terminal records the transform runner should pick back up
    pub resumable: Vec<Uuid>,
}

/// Owner of all pipeline record mutations.
pub struct PipelineTracker {
    store: RecordStore,
    fanout: Arc<SubscriberRegistry>,
    audit: Arc<AuditLedger>,
    retry_policy: RetryPolicy,

    /// Reconstructed records, authoritative copy is the store
    cache: Mutex<HashMap<Uuid, PipelineRecord>>,

    /// Per-record mutual exclusion for transitions
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl PipelineTracker {
    pub fn new(
        store: RecordStore,
        fanout: Arc<SubscriberRegistry>,
        audit: Arc<AuditLedger>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            fanout,
            audit,
            retry_policy,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a record at `Received` for a first-seen recording. Returns
    /// the existing record without writing anything when the id is
    /// already known, which is what makes client retries safe.
    #[instrument(skip(self, recording), fields(recording_id = %recording.id))]
    pub async fn create(
        &self,
        recording: Recording,
        ehr_requested: bool,
    ) -> Result<Created, TrackerError> {
        let lock = self.lock_for(recording.id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.load_locked(recording.id).await? {
            debug!("Recording already tracked, returning existing record");
            return Ok(Created::Existing(existing));
        }

        let transition = Transition::new(
            recording.id,
            1,
            TransitionKind::Created {
                recording: recording.clone(),
                ehr_requested,
            },
        );
        self.store.append(&transition).await?;

        let mut record = PipelineRecord::from_transitions(std::slice::from_ref(&transition))
            .ok_or_else(|| TrackerError::Illegal {
                recording_id: recording.id,
                detail: "creation transition did not produce a record".to_string(),
            })?;

        self.notify(&mut record, false).await?;
        self.cache_put(&record);

        info!("Pipeline record created at received");
        Ok(Created::New(record))
    }

    /// Current record, if known.
    pub async fn get(&self, id: Uuid) -> Result<Option<PipelineRecord>, TrackerError> {
        if let Some(record) = self.cache.lock().expect("tracker cache poisoned").get(&id) {
            return Ok(Some(record.clone()));
        }
        let record = self.store.load(id).await?;
        if let Some(record) = &record {
            self.cache_put(record);
        }
        Ok(record)
    }

    /// Status query: `{stage, stageVersion, lastError}`. The read is
    /// audited off the critical path.
    pub async fn status(
        &self,
        id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<StatusView, TrackerError> {
        let record = self.get(id).await?.ok_or(TrackerError::NotFound(id))?;

        let mut entry = AuditEntry::new("pipeline.status", "pipeline_record")
            .clinic(record.clinic_id)
            .resource(id.to_string());
        if let Some(actor) = actor {
            entry = entry.actor(actor);
        }
        self.audit.record_read(entry);

        Ok(StatusView {
            recording_id: id,
            stage: record.state_label(),
            stage_version: record.stage_version,
            last_error: record.last_error,
        })
    }

    /// Move a record from a ready stage into its working successor so an
    /// engine can be dispatched. Returns the updated record; its stage
    /// and version are the expectation a completion must carry.
    #[instrument(skip(self))]
    pub async fn start_work(&self, id: Uuid) -> Result<PipelineRecord, TrackerError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self
            .load_locked(id)
            .await?
            .ok_or(TrackerError::NotFound(id))?;

        if !record.health.is_active() {
            return Err(TrackerError::Illegal {
                recording_id: id,
                detail: format!("cannot start work while {}", record.state_label()),
            });
        }
        if record.is_terminal() {
            return Err(TrackerError::Illegal {
                recording_id: id,
                detail: "record is terminal".to_string(),
            });
        }
        if record.stage.is_working() {
            return Err(TrackerError::Illegal {
                recording_id: id,
                detail: format!("work already in flight at {}", record.stage),
            });
        }

        let to = record.stage.successor().ok_or_else(|| TrackerError::Illegal {
            recording_id: id,
            detail: "no successor stage".to_string(),
        })?;

        self.commit(&mut record, TransitionKind::Advanced { to }, None)
            .await?;
        Ok(record)
    }

    /// Apply a completion message from a transform engine. Deliveries
    /// whose expectation does not match the current stage/version are
    /// duplicates or stragglers and are discarded without effect.
    #[instrument(skip(self, completion), fields(recording_id = %completion.recording_id, outcome = completion.outcome.label()))]
    pub async fn apply_completion(
        &self,
        completion: TransformCompletion,
    ) -> Result<Applied, TrackerError> {
        let id = completion.recording_id;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self
            .load_locked(id)
            .await?
            .ok_or(TrackerError::NotFound(id))?;

        if record.stage_version != completion.expected_prior_version
            || record.stage != completion.expected_prior_stage
            || !record.health.is_active()
        {
            debug!(
                current_version = record.stage_version,
                expected_version = completion.expected_prior_version,
                current_stage = %record.state_label(),
                "Discarding stale transform completion"
            );
            return Ok(Applied::Stale);
        }

        match completion.outcome {
            TransformOutcome::Transcribed(transcript) => {
                self.check_outcome_stage(&record, Stage::Transcribing)?;
                self.store
                    .store_artifact(id, "transcript", &serde_json::to_string(&transcript)?)
                    .await
                    .map_err(TrackerError::Storage)?;
                self.commit(
                    &mut record,
                    TransitionKind::Advanced { to: Stage::Transcribed },
                    None,
                )
                .await?;
                Ok(Applied::Advanced(record))
            }
            TransformOutcome::Drafted(draft) => {
                self.check_outcome_stage(&record, Stage::Drafting)?;
                self.store
                    .store_artifact(id, "draft", &serde_json::to_string(&draft)?)
                    .await
                    .map_err(TrackerError::Storage)?;
                self.commit(
                    &mut record,
                    TransitionKind::Advanced { to: Stage::Drafted },
                    Some(draft.id),
                )
                .await?;
                Ok(Applied::Advanced(record))
            }
            TransformOutcome::Synced(receipt) => {
                self.check_outcome_stage(&record, Stage::SyncingEhr)?;
                self.store
                    .store_artifact(id, "ehr_receipt", &serde_json::to_string(&receipt)?)
                    .await
                    .map_err(TrackerError::Storage)?;
                self.commit(
                    &mut record,
                    TransitionKind::Advanced { to: Stage::Synced },
                    None,
                )
                .await?;
                Ok(Applied::Advanced(record))
            }
            TransformOutcome::Failed { reason } => {
                warn!(reason = %reason, stage = %record.stage, "Stage failed");
                self.commit(&mut record, TransitionKind::StageFailed { reason }, None)
                    .await?;
                Ok(Applied::FailedStage(record))
            }
        }
    }

    /// Return a failed record to its originating stage, or abandon it
    /// once the stage's attempt budget is spent.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid) -> Result<RetryOutcome, TrackerError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self
            .load_locked(id)
            .await?
            .ok_or(TrackerError::NotFound(id))?;

        let reason = match &record.health {
            RecordHealth::Failed { reason } => reason.clone(),
            _ => {
                return Err(TrackerError::Illegal {
                    recording_id: id,
                    detail: format!("retry of a record that is {}", record.state_label()),
                })
            }
        };

        let attempts = record.attempts_at(record.stage);
        if !self.retry_policy.should_retry(attempts) {
            let detail = format!(
                "retry budget exhausted after {} attempts at {}: {}",
                attempts, record.stage, reason
            );
            warn!(%detail, "Abandoning record");
            self.commit(&mut record, TransitionKind::Abandoned { reason: detail }, None)
                .await?;
            Ok(RetryOutcome::Abandoned(record))
        } else {
            info!(stage = %record.stage, attempts, "Retrying failed stage");
            self.commit(&mut record, TransitionKind::Retried, None)
                .await?;
            Ok(RetryOutcome::Retrying(record))
        }
    }

    /// Give up on a failed record without spending the remaining budget.
    /// Used when the failure is permanent and retrying cannot help.
    #[instrument(skip(self))]
    pub async fn abandon(&self, id: Uuid, reason: String) -> Result<PipelineRecord, TrackerError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self
            .load_locked(id)
            .await?
            .ok_or(TrackerError::NotFound(id))?;

        if !matches!(record.health, RecordHealth::Failed { .. }) {
            return Err(TrackerError::Illegal {
                recording_id: id,
                detail: format!("abandon of a record that is {}", record.state_label()),
            });
        }

        warn!(reason = %reason, "Abandoning record");
        self.commit(&mut record, TransitionKind::Abandoned { reason }, None)
            .await?;
        Ok(record)
    }

    /// Capture-time metadata of a tracked recording.
    pub async fn recording(&self, id: Uuid) -> Result<Option<Recording>, TrackerError> {
        Ok(self.store.load_recording(id).await?)
    }

    /// Stored transform artifact, if the stage producing it has run.
    pub async fn artifact(&self, id: Uuid, name: &str) -> Result<Option<String>, TrackerError> {
        Ok(self.store.load_artifact(id, name).await?)
    }

    /// The retry policy stages run under (shared with the runner).
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Restart recovery: reload every record, re-publish transitions that
    /// were persisted but not notified, and report which records still
    /// need the runner.
    pub async fn recover(&self) -> Result<RecoveryReport, TrackerError> {
        let mut report = RecoveryReport::default();

        for id in self.store.list().await? {
            let lock = self.lock_for(id);
            let _guard = lock.lock().await;

            let Some(mut record) = self.load_locked(id).await? else {
                continue;
            };
            report.records += 1;

            if record.stage_version > record.notified_version {
                info!(
                    recording_id = %id,
                    version = record.stage_version,
                    notified = record.notified_version,
                    "Replaying unnotified transition"
                );
                self.notify(&mut record, false).await?;
                report.replayed += 1;
            }

            if !record.is_terminal() {
                report.resumable.push(id);
            }
            self.cache_put(&record);
        }

        Ok(report)
    }

    /// Explicit message-passing entry point for transform completions.
    /// The returned sender delivers completions to the tracker's drain
    /// task; results are logged, stale messages silently discarded.
    pub fn completion_channel(self: &Arc<Self>) -> mpsc::UnboundedSender<TransformCompletion> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransformCompletion>();
        let tracker = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(completion) = rx.recv().await {
                let id = completion.recording_id;
                if let Err(e) = tracker.apply_completion(completion).await {
                    warn!(recording_id = %id, error = %e, "Completion rejected");
                }
            }
        });

        tx
    }

    fn check_outcome_stage(
        &self,
        record: &PipelineRecord,
        expected: Stage,
    ) -> Result<(), TrackerError> {
        if record.stage != expected {
            return Err(TrackerError::Illegal {
                recording_id: record.recording_id,
                detail: format!(
                    "outcome for {} delivered while record is at {}",
                    expected, record.stage
                ),
            });
        }
        Ok(())
    }

    /// Audit, persist, apply, then notify — in that order. The audit
    /// write gates the mutation; persistence precedes publication.
    async fn commit(
        &self,
        record: &mut PipelineRecord,
        kind: TransitionKind,
        draft_id: Option<Uuid>,
    ) -> Result<(), TrackerError> {
        let next_version = record.stage_version + 1;
        let mut transition = Transition::new(record.recording_id, next_version, kind);
        if let Some(draft_id) = draft_id {
            transition = transition.with_draft(draft_id);
        }

        let mut preview = record.clone();
        preview.apply(&transition);

        self.audit.ensure_writable(Some(record.clinic_id))?;
        self.audit.record(
            &AuditEntry::new("pipeline.transition", "pipeline_record")
                .clinic(record.clinic_id)
                .resource(record.recording_id.to_string())
                .before(serde_json::json!({
                    "state": record.state_label(),
                    "stageVersion": record.stage_version,
                }))
                .after(serde_json::json!({
                    "state": preview.state_label(),
                    "stageVersion": preview.stage_version,
                })),
        )?;

        self.store.append(&transition).await?;
        record.apply(&transition);

        self.notify(record, matches!(record.stage, Stage::Drafted))
            .await?;
        self.cache_put(record);

        Ok(())
    }

    /// Publish the record's current state and durably mark it notified.
    /// `announce_draft` additionally emits `draft_ready` when a draft is
    /// attached.
    async fn notify(
        &self,
        record: &mut PipelineRecord,
        announce_draft: bool,
    ) -> Result<(), TrackerError> {
        let scope = EventScope {
            owner_id: record.owner_id,
            clinic_id: record.clinic_id,
        };

        self.fanout.publish(&StatusEvent::ProcessingStatus {
            recording_id: record.recording_id,
            stage: record.state_label(),
            stage_version: record.stage_version,
            progress: None,
            scope,
        });

        if announce_draft {
            if let Some(draft_id) = record.draft_id {
                self.fanout.publish(&StatusEvent::DraftReady {
                    recording_id: record.recording_id,
                    draft_id,
                    scope,
                });
            }
        }

        let marker = Transition::new(
            record.recording_id,
            record.stage_version,
            TransitionKind::Notified,
        );
        self.store.append(&marker).await?;
        record.apply(&marker);

        Ok(())
    }

    async fn load_locked(&self, id: Uuid) -> Result<Option<PipelineRecord>, TrackerError> {
        if let Some(record) = self.cache.lock().expect("tracker cache poisoned").get(&id) {
            return Ok(Some(record.clone()));
        }
        Ok(self.store.load(id).await?)
    }

    fn cache_put(&self, record: &PipelineRecord) {
        self.cache
            .lock()
            .expect("tracker cache poisoned")
            .insert(record.recording_id, record.clone());
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("tracker lock map poisoned")
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(anyhow::Error::new(e))
    }
}
