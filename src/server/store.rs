//! Durable server-side state: per-recording transition logs and the
//! audio blob store boundary.
//!
//! Transition logs are newline-delimited JSON, one directory per
//! recording, replayed to reconstruct the authoritative record. The blob
//! store is an external collaborator consumed through a trait, with a
//! filesystem implementation backing tests and single-node deployments.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{PipelineRecord, Recording, Transition, TransitionKind};
use crate::error::{Classify, ErrorClass};

/// File-based store of pipeline record transition logs.
pub struct RecordStore {
    base_dir: PathBuf,
}

impl RecordStore {
    /// Create or open the store rooted at `base_dir`.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("Failed to create record store: {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    fn record_dir(&self, recording_id: Uuid) -> PathBuf {
        self.base_dir.join(recording_id.to_string())
    }

    fn transitions_path(&self, recording_id: Uuid) -> PathBuf {
        self.record_dir(recording_id).join("transitions.jsonl")
    }

    /// Append a transition and flush it durably. The caller guarantees
    /// per-record serialization; this only guarantees durability.
    pub async fn append(&self, transition: &Transition) -> Result<()> {
        let dir = self.record_dir(transition.recording_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create record dir: {}", dir.display()))?;

        let path = self.transitions_path(transition.recording_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open transition log: {}", path.display()))?;

        let json = serde_json::to_string(transition).context("Failed to serialize transition")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write transition")?;
        file.flush().await.context("Failed to flush transition")?;
        file.sync_data().await.context("Failed to sync transition")?;

        Ok(())
    }

    /// Replay a record's transitions in order.
    pub async fn replay(&self, recording_id: Uuid) -> Result<Vec<Transition>> {
        let path = self.transitions_path(recording_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open transition log: {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut transitions = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let transition: Transition = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse transition: {}", line))?;
            transitions.push(transition);
        }

        Ok(transitions)
    }

    /// Reconstruct the current record state, if the recording is known.
    pub async fn load(&self, recording_id: Uuid) -> Result<Option<PipelineRecord>> {
        let transitions = self.replay(recording_id).await?;
        Ok(PipelineRecord::from_transitions(&transitions))
    }

    /// The capture-time recording metadata, from the creation transition.
    pub async fn load_recording(&self, recording_id: Uuid) -> Result<Option<Recording>> {
        let transitions = self.replay(recording_id).await?;
        Ok(transitions.into_iter().find_map(|t| match t.kind {
            TransitionKind::Created { recording, .. } => Some(recording),
            _ => None,
        }))
    }

    /// Store a transform artifact (transcript, draft) alongside the log.
    pub async fn store_artifact(
        &self,
        recording_id: Uuid,
        name: &str,
        content: &str,
    ) -> Result<PathBuf> {
        let dir = self.record_dir(recording_id).join("artifacts");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifacts dir: {}", dir.display()))?;

        let path = dir.join(format!("{}.json", name));
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
        Ok(path)
    }

    /// Load a transform artifact if present.
    pub async fn load_artifact(&self, recording_id: Uuid, name: &str) -> Result<Option<String>> {
        let path = self
            .record_dir(recording_id)
            .join("artifacts")
            .join(format!("{}.json", name));
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", path.display()))?;
        Ok(Some(content))
    }

    /// List all recording ids with a transition log.
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();

        if !self.base_dir.exists() {
            return Ok(ids);
        }

        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        ids.push(uuid);
                    }
                }
            }
        }

        Ok(ids)
    }
}

/// Errors from the blob store collaborator.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Storage engine busy or unreachable; the client should retry.
    #[error("blob storage unavailable: {0}")]
    Unavailable(String),

    #[error("blob not found for recording {0}")]
    NotFound(Uuid),
}

impl Classify for BlobError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) => ErrorClass::Transient,
            Self::NotFound(_) => ErrorClass::Permanent,
        }
    }
}

/// Durable home of accepted audio bytes. External collaborator; only the
/// boundary is specified here.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, recording_id: Uuid, bytes: &[u8]) -> Result<(), BlobError>;
    async fn get(&self, recording_id: Uuid) -> Result<Vec<u8>, BlobError>;
}

/// Filesystem-backed blob store.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create blob dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn blob_path(&self, recording_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.bin", recording_id))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, recording_id: Uuid, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.blob_path(recording_id);
        fs::write(&path, bytes)
            .await
            .map_err(|e| BlobError::Unavailable(e.to_string()))
    }

    async fn get(&self, recording_id: Uuid) -> Result<Vec<u8>, BlobError> {
        let path = self.blob_path(recording_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(recording_id))
            }
            Err(e) => Err(BlobError::Unavailable(e.to_string())),
        }
    }
}

/// Path helper for wiring the store layout under one data directory.
pub fn records_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("records")
}

/// Path helper for the blob directory.
pub fn blobs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("blobs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Recording, Stage, TransitionKind};
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_and_replay_preserves_order() {
        let temp = TempDir::new().unwrap();
        let store = RecordStore::open(temp.path()).await.unwrap();

        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"audio", 100);
        let id = recording.id;

        store
            .append(&Transition::new(
                id,
                1,
                TransitionKind::Created {
                    recording,
                    ehr_requested: false,
                },
            ))
            .await
            .unwrap();
        store
            .append(&Transition::new(
                id,
                2,
                TransitionKind::Advanced { to: Stage::Transcribing },
            ))
            .await
            .unwrap();

        let transitions = store.replay(id).await.unwrap();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].stage_version, 1);
        assert_eq!(transitions[1].stage_version, 2);

        let record = store.load(id).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Transcribing);
        assert_eq!(record.stage_version, 2);
    }

    #[tokio::test]
    async fn load_of_unknown_recording_is_none() {
        let temp = TempDir::new().unwrap();
        let store = RecordStore::open(temp.path()).await.unwrap();
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_known_recordings() {
        let temp = TempDir::new().unwrap();
        let store = RecordStore::open(temp.path()).await.unwrap();

        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"audio", 100);
        let id = recording.id;
        store
            .append(&Transition::new(
                id,
                1,
                TransitionKind::Created {
                    recording,
                    ehr_requested: false,
                },
            ))
            .await
            .unwrap();

        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec![id]);
    }

    #[tokio::test]
    async fn fs_blob_store_round_trip() {
        let temp = TempDir::new().unwrap();
        let blobs = FsBlobStore::open(temp.path()).await.unwrap();
        let id = Uuid::new_v4();

        blobs.put(id, b"payload").await.unwrap();
        assert_eq!(blobs.get(id).await.unwrap(), b"payload");

        let missing = blobs.get(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(BlobError::NotFound(_))));
    }
}
