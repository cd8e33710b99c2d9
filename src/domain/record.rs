//! Pipeline record state and reconstruction from its transition log.
//!
//! A `PipelineRecord` is the authoritative server-side progress of one
//! recording. It is never stored as a snapshot; the current state is
//! derived by replaying the append-only transition log in order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::recording::Recording;
use super::stage::{RecordHealth, Stage};

/// One persisted entry in a record's transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Unique identifier for this transition.
    pub id: Uuid,

    /// The recording this transition belongs to.
    pub recording_id: Uuid,

    /// Version after this transition was applied. Strictly increasing
    /// for every state change; `Notified` markers reference the version
    /// they published instead of allocating a new one.
    pub stage_version: u64,

    /// What happened.
    pub kind: TransitionKind,

    /// Draft produced by the drafting engine, attached on the advance
    /// into `Drafted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<Uuid>,

    /// When the transition was persisted.
    pub recorded_at: DateTime<Utc>,
}

impl Transition {
    pub fn new(recording_id: Uuid, stage_version: u64, kind: TransitionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            recording_id,
            stage_version,
            kind,
            draft_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_draft(mut self, draft_id: Uuid) -> Self {
        self.draft_id = Some(draft_id);
        self
    }

    /// Whether this entry changes record state (as opposed to marking
    /// the notification cursor).
    pub fn is_state_change(&self) -> bool {
        !matches!(self.kind, TransitionKind::Notified)
    }
}

/// Kinds of transition log entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransitionKind {
    /// Record created by ingestion at stage `Received`.
    Created {
        recording: Recording,
        ehr_requested: bool,
    },

    /// Forward move to the next stage.
    Advanced { to: Stage },

    /// The current stage failed.
    StageFailed { reason: String },

    /// Returned to the originating stage for another attempt.
    Retried,

    /// Retry budget exhausted; processing gave up.
    Abandoned { reason: String },

    /// Marker: the transition at `stage_version` was published to
    /// subscribers. Used to replay unnotified transitions after a crash.
    Notified,
}

/// Authoritative progress of one recording through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub recording_id: Uuid,
    pub owner_id: Uuid,
    pub clinic_id: Uuid,

    /// Current stage; while `health` is failed this is the originating
    /// stage a retry returns to.
    pub stage: Stage,

    /// Monotonic counter, bumped on every persisted state change.
    pub stage_version: u64,

    pub health: RecordHealth,

    /// Whether EHR sync was requested for this recording.
    pub ehr_requested: bool,

    /// Most recent failure reason, if any.
    pub last_error: Option<String>,

    /// Draft produced by the drafting engine.
    pub draft_id: Option<Uuid>,

    /// Work attempts per stage (first run and retries both count).
    pub attempts: HashMap<Stage, u32>,

    /// When each stage was entered.
    pub entered_at: HashMap<Stage, DateTime<Utc>>,

    /// Highest version already published to subscribers.
    pub notified_version: u64,
}

impl PipelineRecord {
    /// Reconstruct a record from its transition log.
    pub fn from_transitions(transitions: &[Transition]) -> Option<Self> {
        let mut record: Option<Self> = None;
        for t in transitions {
            match (&mut record, &t.kind) {
                (None, TransitionKind::Created { recording, ehr_requested }) => {
                    let mut rec = Self {
                        recording_id: recording.id,
                        owner_id: recording.owner_id,
                        clinic_id: recording.clinic_id,
                        stage: Stage::Received,
                        stage_version: t.stage_version,
                        health: RecordHealth::Active,
                        ehr_requested: *ehr_requested,
                        last_error: None,
                        draft_id: None,
                        attempts: HashMap::new(),
                        entered_at: HashMap::new(),
                        notified_version: 0,
                    };
                    rec.entered_at.insert(Stage::Received, t.recorded_at);
                    record = Some(rec);
                }
                (Some(rec), _) => rec.apply(t),
                // A log that does not start with Created is corrupt;
                // surface as missing rather than a partial record.
                (None, _) => return None,
            }
        }
        record
    }

    /// Apply a single transition to the state.
    pub fn apply(&mut self, t: &Transition) {
        match &t.kind {
            TransitionKind::Created { .. } => {}
            TransitionKind::Advanced { to } => {
                self.stage = *to;
                self.stage_version = t.stage_version;
                self.health = RecordHealth::Active;
                self.last_error = None;
                self.entered_at.insert(*to, t.recorded_at);
                if to.is_working() {
                    *self.attempts.entry(*to).or_insert(0) += 1;
                }
                if let Some(draft_id) = t.draft_id {
                    self.draft_id = Some(draft_id);
                }
            }
            TransitionKind::StageFailed { reason } => {
                self.stage_version = t.stage_version;
                self.health = RecordHealth::Failed {
                    reason: reason.clone(),
                };
                self.last_error = Some(reason.clone());
            }
            TransitionKind::Retried => {
                self.stage_version = t.stage_version;
                self.health = RecordHealth::Active;
                *self.attempts.entry(self.stage).or_insert(0) += 1;
            }
            TransitionKind::Abandoned { reason } => {
                self.stage_version = t.stage_version;
                self.health = RecordHealth::Abandoned {
                    reason: reason.clone(),
                };
                self.last_error = Some(reason.clone());
            }
            TransitionKind::Notified => {
                self.notified_version = self.notified_version.max(t.stage_version);
            }
        }
    }

    /// Attempts recorded for a stage.
    pub fn attempts_at(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Whether processing has reached a terminal outcome.
    pub fn is_terminal(&self) -> bool {
        self.health.is_abandoned() || self.stage.is_terminal(self.ehr_requested)
    }

    /// Wire label for the current state (stage name, or the failure
    /// marker while unhealthy).
    pub fn state_label(&self) -> String {
        match &self.health {
            RecordHealth::Active => self.stage.label().to_string(),
            RecordHealth::Failed { .. } => format!("failed:{}", self.stage.label()),
            RecordHealth::Abandoned { .. } => "abandoned".to_string(),
        }
    }
}
