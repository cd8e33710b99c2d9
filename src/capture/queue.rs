//! Durable local queue of not-yet-confirmed recordings.
//!
//! Append-only JSONL with state derived from replay. Each state change is
//! appended as a new entry and flushed to disk before the call returns, so
//! a crash can never leave in-memory state ahead of durable storage. An
//! entry leaves the log only through compaction, after it has been
//! acknowledged by the server and a grace period has elapsed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::Recording;
use crate::error::{is_storage_full, Classify, ErrorClass};

/// Errors that can occur with the capture queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue entry not found: {0}")]
    NotFound(Uuid),

    #[error("Local storage exhausted")]
    StorageFull,

    #[error("Queue is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("Invalid state transition: {from:?} → {to:?}")]
    InvalidTransition {
        from: UploadState,
        to: UploadState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for QueueError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::StorageFull => ErrorClass::Fatal,
            Self::NotFound(_) | Self::InvalidTransition { .. } => ErrorClass::Permanent,
            Self::Locked(_) | Self::Io(_) | Self::Serialization(_) => ErrorClass::Transient,
        }
    }
}

/// Client-side lifecycle of a queued recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Capture finished, media durably on device.
    Captured,

    /// Ready for the synchronizer to pick up.
    QueuedForUpload,

    /// One attempt in flight.
    Uploading,

    /// Server accepted the recording. Bytes are now the server's.
    Acknowledged,

    /// Attempt failed with a transient error; will be retried.
    UploadFailed,

    /// Server rejected the payload as invalid. Surfaced, never retried
    /// automatically, never dropped.
    Rejected,
}

impl UploadState {
    /// Legal transitions of the client-side state machine.
    pub fn can_transition(from: UploadState, to: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (from, to),
            (Captured, QueuedForUpload)
                | (QueuedForUpload, Uploading)
                | (Uploading, Acknowledged)
                | (Uploading, UploadFailed)
                | (Uploading, Rejected)
                | (UploadFailed, Uploading)
                | (UploadFailed, QueuedForUpload)
        )
    }
}

/// An event in the queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    /// The recording this event belongs to
    pub recording_id: Uuid,

    /// What happened
    #[serde(flatten)]
    pub kind: QueueEventKind,
}

/// Types of queue events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum QueueEventKind {
    /// Recording captured and added to the queue
    Enqueued {
        recording: Recording,
        media_path: PathBuf,
    },

    /// Marked ready for upload
    QueuedForUpload,

    /// Upload attempt started
    UploadStarted,

    /// Server acknowledged the upload
    Acknowledged,

    /// Upload attempt failed (transient); retry scheduled
    UploadFailed {
        error: String,
        next_retry_at: DateTime<Utc>,
    },

    /// Server rejected the payload (permanent)
    Rejected { reason: String },

    /// Manual retry after the automatic budget ran out; resets attempts
    Requeued,
}

/// A state change requested through [`CaptureQueue::mark_state`].
#[derive(Debug, Clone)]
pub enum StateChange {
    QueuedForUpload,
    Uploading,
    Acknowledged,
    UploadFailed {
        error: String,
        next_retry_at: DateTime<Utc>,
    },
    Rejected { reason: String },
    /// Manual user-initiated requeue of a failed entry
    Requeued,
}

impl StateChange {
    fn target(&self) -> UploadState {
        match self {
            Self::QueuedForUpload | Self::Requeued => UploadState::QueuedForUpload,
            Self::Uploading => UploadState::Uploading,
            Self::Acknowledged => UploadState::Acknowledged,
            Self::UploadFailed { .. } => UploadState::UploadFailed,
            Self::Rejected { .. } => UploadState::Rejected,
        }
    }

    fn into_event_kind(self) -> QueueEventKind {
        match self {
            Self::QueuedForUpload => QueueEventKind::QueuedForUpload,
            Self::Uploading => QueueEventKind::UploadStarted,
            Self::Acknowledged => QueueEventKind::Acknowledged,
            Self::UploadFailed { error, next_retry_at } => {
                QueueEventKind::UploadFailed { error, next_retry_at }
            }
            Self::Rejected { reason } => QueueEventKind::Rejected { reason },
            Self::Requeued => QueueEventKind::Requeued,
        }
    }
}

/// A queue entry with current state (derived from replaying events)
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub recording: Recording,

    /// Device-local path of the audio payload
    pub media_path: PathBuf,

    pub state: UploadState,

    /// Upload attempts so far (reset by a manual requeue)
    pub attempts: u32,

    pub last_error: Option<String>,

    /// Earliest time the next attempt may run
    pub next_retry_at: Option<DateTime<Utc>>,

    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Whether the entry may be dropped by compaction.
    pub fn is_purgeable(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        match (self.state, self.acknowledged_at) {
            (UploadState::Acknowledged, Some(at)) => {
                now.signed_duration_since(at).to_std().map(|d| d >= grace).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Whether the synchronizer may attempt this entry now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            UploadState::QueuedForUpload => true,
            UploadState::UploadFailed => self
                .next_retry_at
                .map(|at| at <= now)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Whether the entry has exhausted its automatic retry budget and
    /// needs the user's attention.
    pub fn needs_attention(&self, max_attempts: u32) -> bool {
        match self.state {
            UploadState::UploadFailed => self.attempts >= max_attempts,
            UploadState::Rejected => true,
            _ => false,
        }
    }
}

/// JSONL-backed capture queue with an exclusive advisory lock.
pub struct CaptureQueue {
    queue_path: PathBuf,

    /// Serializes mutations within the process (single-writer discipline)
    writer: Mutex<()>,

    /// Held for the queue's lifetime to keep other processes out
    _lock: std::fs::File,
}

impl CaptureQueue {
    /// Open the queue in `dir`, creating it if needed. Takes an exclusive
    /// lock and reverts any entry left `Uploading` by a crash.
    pub async fn open(dir: &Path) -> Result<Self, QueueError> {
        fs::create_dir_all(dir).await?;

        let lock_path = dir.join("queue.lock");
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(QueueError::Locked(lock_path));
        }

        let queue = Self {
            queue_path: dir.join("queue.jsonl"),
            writer: Mutex::new(()),
            _lock: lock,
        };

        queue.recover_interrupted().await?;
        Ok(queue)
    }

    /// Entries left `Uploading` across a restart lost their in-flight
    /// attempt; put them back on the retry path.
    async fn recover_interrupted(&self) -> Result<(), QueueError> {
        let items = self.replay().await?;
        for entry in items.values() {
            if entry.state == UploadState::Uploading {
                tracing::warn!(
                    recording_id = %entry.recording.id,
                    "Recovering upload interrupted by restart"
                );
                self.append_event(&QueueEvent {
                    timestamp: Utc::now(),
                    recording_id: entry.recording.id,
                    kind: QueueEventKind::UploadFailed {
                        error: "upload interrupted by restart".to_string(),
                        next_retry_at: Utc::now(),
                    },
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Append an event to the queue log and flush it to disk.
    async fn append_event(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.queue_path)
            .await
            .map_err(map_io)?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(map_io)?;
        file.flush().await.map_err(map_io)?;
        file.sync_data().await.map_err(map_io)?;

        Ok(())
    }

    /// Replay all events to build current state
    pub async fn replay(&self) -> Result<HashMap<Uuid, QueueEntry>, QueueError> {
        let mut items: HashMap<Uuid, QueueEntry> = HashMap::new();

        if !self.queue_path.exists() {
            return Ok(items);
        }

        let file = File::open(&self.queue_path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let event: QueueEvent = serde_json::from_str(&line)?;
            Self::apply_event(&mut items, event);
        }

        Ok(items)
    }

    /// Apply a single event to the state
    fn apply_event(items: &mut HashMap<Uuid, QueueEntry>, event: QueueEvent) {
        match event.kind {
            QueueEventKind::Enqueued { recording, media_path } => {
                items.insert(
                    event.recording_id,
                    QueueEntry {
                        recording,
                        media_path,
                        state: UploadState::Captured,
                        attempts: 0,
                        last_error: None,
                        next_retry_at: None,
                        acknowledged_at: None,
                    },
                );
            }
            QueueEventKind::QueuedForUpload => {
                if let Some(entry) = items.get_mut(&event.recording_id) {
                    entry.state = UploadState::QueuedForUpload;
                }
            }
            QueueEventKind::UploadStarted => {
                if let Some(entry) = items.get_mut(&event.recording_id) {
                    entry.state = UploadState::Uploading;
                    entry.attempts += 1;
                }
            }
            QueueEventKind::Acknowledged => {
                if let Some(entry) = items.get_mut(&event.recording_id) {
                    entry.state = UploadState::Acknowledged;
                    entry.acknowledged_at = Some(event.timestamp);
                    entry.last_error = None;
                    entry.next_retry_at = None;
                }
            }
            QueueEventKind::UploadFailed { error, next_retry_at } => {
                if let Some(entry) = items.get_mut(&event.recording_id) {
                    entry.state = UploadState::UploadFailed;
                    entry.last_error = Some(error);
                    entry.next_retry_at = Some(next_retry_at);
                }
            }
            QueueEventKind::Rejected { reason } => {
                if let Some(entry) = items.get_mut(&event.recording_id) {
                    entry.state = UploadState::Rejected;
                    entry.last_error = Some(reason);
                    entry.next_retry_at = None;
                }
            }
            QueueEventKind::Requeued => {
                if let Some(entry) = items.get_mut(&event.recording_id) {
                    entry.state = UploadState::QueuedForUpload;
                    entry.attempts = 0;
                    entry.last_error = None;
                    entry.next_retry_at = None;
                }
            }
        }
    }

    /// Add a captured recording (idempotent - returns the existing entry
    /// if the id is already queued, without writing anything).
    pub async fn enqueue(
        &self,
        recording: Recording,
        media_path: PathBuf,
    ) -> Result<Enqueued, QueueError> {
        let _guard = self.writer.lock().await;

        let items = self.replay().await?;
        if let Some(existing) = items.get(&recording.id) {
            return Ok(Enqueued::Existing(existing.clone()));
        }

        let id = recording.id;
        self.append_event(&QueueEvent {
            timestamp: Utc::now(),
            recording_id: id,
            kind: QueueEventKind::Enqueued { recording, media_path },
        })
        .await?;

        let items = self.replay().await?;
        let entry = items.get(&id).cloned().ok_or(QueueError::NotFound(id))?;
        Ok(Enqueued::New(entry))
    }

    /// The only mutator. Validates the transition, appends the event and
    /// flushes it durably before returning the updated entry.
    pub async fn mark_state(
        &self,
        id: Uuid,
        change: StateChange,
    ) -> Result<QueueEntry, QueueError> {
        let _guard = self.writer.lock().await;

        let items = self.replay().await?;
        let entry = items.get(&id).ok_or(QueueError::NotFound(id))?;

        let to = change.target();
        if !UploadState::can_transition(entry.state, to) {
            return Err(QueueError::InvalidTransition {
                from: entry.state,
                to,
            });
        }

        self.append_event(&QueueEvent {
            timestamp: Utc::now(),
            recording_id: id,
            kind: change.into_event_kind(),
        })
        .await?;

        let items = self.replay().await?;
        items.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    /// All entries not yet acknowledged or rejected, oldest capture first.
    pub async fn list_pending(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let items = self.replay().await?;
        let mut pending: Vec<QueueEntry> = items
            .into_values()
            .filter(|entry| {
                !matches!(
                    entry.state,
                    UploadState::Acknowledged | UploadState::Rejected
                )
            })
            .collect();

        pending.sort_by(|a, b| a.recording.captured_at.cmp(&b.recording.captured_at));

        Ok(pending)
    }

    /// Entries the synchronizer should attempt now, oldest capture first.
    pub async fn list_due(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut due: Vec<QueueEntry> = self
            .list_pending()
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now) && !entry.needs_attention(max_attempts))
            .collect();
        due.sort_by(|a, b| a.recording.captured_at.cmp(&b.recording.captured_at));
        Ok(due)
    }

    /// Entries requiring manual intervention.
    pub async fn list_attention(&self, max_attempts: u32) -> Result<Vec<QueueEntry>, QueueError> {
        let items = self.replay().await?;
        Ok(items
            .into_values()
            .filter(|entry| entry.needs_attention(max_attempts))
            .collect())
    }

    /// Get a specific entry by recording id
    pub async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, QueueError> {
        let items = self.replay().await?;
        Ok(items.get(&id).cloned())
    }

    /// Queue status summary
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let items = self.replay().await?;

        let mut status = QueueStatus::default();
        for entry in items.values() {
            match entry.state {
                UploadState::Captured => status.captured += 1,
                UploadState::QueuedForUpload => status.queued += 1,
                UploadState::Uploading => status.uploading += 1,
                UploadState::Acknowledged => status.acknowledged += 1,
                UploadState::UploadFailed => status.failed += 1,
                UploadState::Rejected => status.rejected += 1,
            }
        }
        Ok(status)
    }

    /// Drop entries whose acknowledgement has aged past the grace period.
    /// Rewrites the log to a temp file and renames it into place so a
    /// crash mid-compaction can never lose a retained entry.
    pub async fn compact(&self, grace: Duration) -> Result<usize, QueueError> {
        let _guard = self.writer.lock().await;

        let items = self.replay().await?;
        let now = Utc::now();
        let purged: Vec<Uuid> = items
            .values()
            .filter(|entry| entry.is_purgeable(grace, now))
            .map(|entry| entry.recording.id)
            .collect();

        if purged.is_empty() {
            return Ok(0);
        }

        let tmp_path = self.queue_path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path).await.map_err(map_io)?;
            let file = File::open(&self.queue_path).await?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();

            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let event: QueueEvent = serde_json::from_str(&line)?;
                if !purged.contains(&event.recording_id) {
                    tmp.write_all(format!("{}\n", line).as_bytes())
                        .await
                        .map_err(map_io)?;
                }
            }
            tmp.flush().await.map_err(map_io)?;
            tmp.sync_data().await.map_err(map_io)?;
        }

        fs::rename(&tmp_path, &self.queue_path).await?;

        tracing::info!(purged = purged.len(), "Compacted capture queue");
        Ok(purged.len())
    }
}

/// Result of enqueueing a recording
#[derive(Debug, Clone)]
pub enum Enqueued {
    /// New entry written
    New(QueueEntry),

    /// Recording id already present; nothing written
    Existing(QueueEntry),
}

impl Enqueued {
    pub fn entry(&self) -> &QueueEntry {
        match self {
            Self::New(entry) | Self::Existing(entry) => entry,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Queue status summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub captured: usize,
    pub queued: usize,
    pub uploading: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.captured + self.queued + self.uploading + self.acknowledged + self.failed + self.rejected
    }
}

fn map_io(err: std::io::Error) -> QueueError {
    if is_storage_full(&err) {
        QueueError::StorageFull
    } else {
        QueueError::Io(err)
    }
}
