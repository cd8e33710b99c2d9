//! Server-side processing stages for a recording.
//!
//! The stage progression is strictly forward:
//!
//! ```text
//! Received → Transcribing → Transcribed → Drafting → Drafted
//!                                             → SyncingEhr → Synced
//! ```
//!
//! Any stage may fail; a failed record either returns to its originating
//! stage via a retry or ends up abandoned. Backward movement is never
//! allowed outside the retry path.

use serde::{Deserialize, Serialize};

/// A named step in the server-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Accepted by ingestion, bytes persisted, waiting for transcription.
    Received,

    /// Transcription engine is working.
    Transcribing,

    /// Transcript available, waiting for drafting.
    Transcribed,

    /// Drafting/coding engine is working.
    Drafting,

    /// Draft note available. Terminal unless EHR sync was requested.
    Drafted,

    /// EHR sync collaborator is working.
    SyncingEhr,

    /// Note delivered to the EHR. Terminal.
    Synced,
}

impl Stage {
    /// The stage a forward transition from `self` must land on.
    pub fn successor(self) -> Option<Stage> {
        match self {
            Self::Received => Some(Self::Transcribing),
            Self::Transcribing => Some(Self::Transcribed),
            Self::Transcribed => Some(Self::Drafting),
            Self::Drafting => Some(Self::Drafted),
            Self::Drafted => Some(Self::SyncingEhr),
            Self::SyncingEhr => Some(Self::Synced),
            Self::Synced => None,
        }
    }

    /// Whether `to` is a legal forward transition from `self`.
    pub fn allows_advance_to(self, to: Stage) -> bool {
        self.successor() == Some(to)
    }

    /// Stages where an external transform is in flight. A working stage
    /// exits only through its completion message or a timeout failure.
    pub fn is_working(self) -> bool {
        matches!(self, Self::Transcribing | Self::Drafting | Self::SyncingEhr)
    }

    /// Whether this stage ends processing for a record that did not
    /// request EHR sync.
    pub fn is_terminal(self, ehr_requested: bool) -> bool {
        match self {
            Self::Synced => true,
            Self::Drafted => !ehr_requested,
            _ => false,
        }
    }

    /// Wire label used in status events and queries.
    pub fn label(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Transcribing => "transcribing",
            Self::Transcribed => "transcribed",
            Self::Drafting => "drafting",
            Self::Drafted => "drafted",
            Self::SyncingEhr => "syncing_ehr",
            Self::Synced => "synced",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a record is progressing, failed at a stage, or given up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "health")]
pub enum RecordHealth {
    /// Normal forward progress.
    Active,

    /// The current stage failed. Eligible for retry while the attempt
    /// budget lasts.
    Failed { reason: String },

    /// Retry budget exhausted. Terminal; surfaced, never hidden.
    Abandoned { reason: String },
}

impl RecordHealth {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned { .. })
    }
}
