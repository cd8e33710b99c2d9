//! Events pushed to connected clients, and the ingestion acknowledgement.
//!
//! Status events are a latency optimization, not the source of truth: a
//! client that misses one re-syncs from the status query on reconnect.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authorization scope of an event. Delivery is restricted to the owning
/// user and staff of the owning clinic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    pub owner_id: Uuid,
    pub clinic_id: Uuid,
}

/// A push event delivered to subscribed clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StatusEvent {
    /// A recording moved through the pipeline.
    #[serde(rename_all = "camelCase")]
    ProcessingStatus {
        recording_id: Uuid,
        /// State label: stage name, `failed:<stage>`, or `abandoned`.
        stage: String,
        stage_version: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        scope: EventScope,
    },

    /// A draft note is ready for review.
    #[serde(rename_all = "camelCase")]
    DraftReady {
        recording_id: Uuid,
        draft_id: Uuid,
        scope: EventScope,
    },
}

impl StatusEvent {
    pub fn recording_id(&self) -> Uuid {
        match self {
            Self::ProcessingStatus { recording_id, .. } => *recording_id,
            Self::DraftReady { recording_id, .. } => *recording_id,
        }
    }

    pub fn scope(&self) -> EventScope {
        match self {
            Self::ProcessingStatus { scope, .. } => *scope,
            Self::DraftReady { scope, .. } => *scope,
        }
    }
}

/// Server acknowledgement of an accepted upload. Returned unchanged for
/// retried uploads of an already-accepted recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAck {
    pub acknowledged: bool,
    pub recording_id: Uuid,
    pub current_stage: String,
}
