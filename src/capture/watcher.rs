//! Capture directory watcher.
//!
//! Watches the recorder's output directory for new audio files and
//! enqueues them once they are stable (the recorder has finished
//! writing). Recordings found here get their client id at enqueue time
//! and go straight to `QueuedForUpload`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::capture::queue::{CaptureQueue, StateChange};
use crate::domain::Recording;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who the recordings on this device belong to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub owner_id: Uuid,
    pub clinic_id: Uuid,
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory the recorder writes finished captures into
    pub watch_path: PathBuf,

    /// How long a file must be stable before processing (seconds)
    pub stability_delay_secs: u64,

    /// File extensions to watch
    pub extensions: Vec<String>,
}

impl WatcherConfig {
    pub fn new(watch_path: PathBuf) -> Self {
        Self {
            watch_path,
            stability_delay_secs: 5,
            extensions: vec!["m4a".to_string(), "aac".to_string(), "wav".to_string()],
        }
    }

    /// Check if the watch path exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.watch_path.exists() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(())
    }
}

/// Result of a directory scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub new_files: usize,
    pub already_queued: usize,
    pub errors: usize,
}

/// Watches for finished captures and feeds the queue.
pub struct CaptureWatcher {
    config: WatcherConfig,
    identity: DeviceIdentity,
}

impl CaptureWatcher {
    pub fn new(config: WatcherConfig, identity: DeviceIdentity) -> Self {
        Self { config, identity }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Scan the directory once and enqueue any existing files.
    pub async fn scan_once(&self, queue: &CaptureQueue) -> Result<ScanResult> {
        self.config.validate()?;

        let mut result = ScanResult::default();
        let mut entries = tokio::fs::read_dir(&self.config.watch_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if !self.is_audio_file(&path) {
                continue;
            }

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_file() || metadata.len() == 0 {
                continue;
            }

            match enqueue_file(queue, self.identity, &path).await {
                Ok(true) => result.new_files += 1,
                Ok(false) => result.already_queued += 1,
                Err(e) => {
                    tracing::warn!("Failed to enqueue {}: {}", path.display(), e);
                    result.errors += 1;
                }
            }
        }

        Ok(result)
    }

    /// Watch the directory and emit enqueued recordings until stopped.
    pub async fn watch(
        &self,
        queue: Arc<CaptureQueue>,
    ) -> Result<(mpsc::Receiver<Recording>, WatchHandle)> {
        self.config.validate()?;

        let (event_tx, event_rx) = mpsc::channel::<Recording>(100);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let config = self.config.clone();
        let identity = self.identity;

        let handle = tokio::spawn(async move {
            if let Err(e) = run_watcher(config, identity, queue, event_tx, &mut stop_rx).await {
                tracing::error!("Watcher error: {}", e);
            }
        });

        Ok((
            event_rx,
            WatchHandle {
                stop_tx,
                task: handle,
            },
        ))
    }

    fn is_audio_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.config
                    .extensions
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

/// Hash the file, build the recording, enqueue it, and mark it ready for
/// upload. Returns false when the content was already queued.
async fn enqueue_file(
    queue: &CaptureQueue,
    identity: DeviceIdentity,
    path: &Path,
) -> Result<bool> {
    let bytes = tokio::fs::read(path).await?;

    // Same content already queued under another capture? The queue is
    // keyed by recording id, so re-discovered files are caught by path.
    let existing = queue
        .list_pending()
        .await?
        .into_iter()
        .any(|entry| entry.media_path == path);
    if existing {
        return Ok(false);
    }

    // Duration is only known to the recorder; files found on disk carry 0.
    let recording = Recording::capture(identity.owner_id, identity.clinic_id, &bytes, 0);
    let id = recording.id;

    let enqueued = queue.enqueue(recording, path.to_path_buf()).await?;
    if enqueued.is_new() {
        queue.mark_state(id, StateChange::QueuedForUpload).await?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Internal watcher loop
async fn run_watcher(
    config: WatcherConfig,
    identity: DeviceIdentity,
    queue: Arc<CaptureQueue>,
    event_tx: mpsc::Sender<Recording>,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    // Track files being stabilized (path -> (size, last_seen))
    let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_secs(2), tx)?;
    debouncer
        .watcher()
        .watch(&config.watch_path, RecursiveMode::NonRecursive)?;

    let stability_delay = Duration::from_secs(config.stability_delay_secs);

    tracing::info!("Watching {} for finished captures", config.watch_path.display());

    loop {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("Watcher stopping...");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(events)) => {
                for event in events {
                    let path = event.path;

                    if !path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| config.extensions.iter().any(|ext| ext.eq_ignore_ascii_case(e)))
                        .unwrap_or(false)
                    {
                        continue;
                    }

                    if let Ok(metadata) = std::fs::metadata(&path) {
                        if metadata.is_file() {
                            pending.insert(path, (metadata.len(), Instant::now()));
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watcher error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                // Expected - continue to stability check
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                tracing::error!("Watcher channel disconnected");
                break;
            }
        }

        // Promote files whose size stopped changing
        let now = Instant::now();
        let mut stable_files = Vec::new();
        for (path, (last_size, last_seen)) in pending.iter() {
            if now.duration_since(*last_seen) >= stability_delay {
                if let Ok(metadata) = std::fs::metadata(path) {
                    if metadata.len() == *last_size && metadata.len() > 0 {
                        stable_files.push(path.clone());
                    }
                }
            }
        }

        for path in stable_files {
            pending.remove(&path);

            match enqueue_file(&queue, identity, &path).await {
                Ok(true) => {
                    if let Ok(Some(entry)) = queue
                        .list_pending()
                        .await
                        .map(|p| p.into_iter().find(|e| e.media_path == path))
                    {
                        tracing::info!(
                            recording_id = %entry.recording.id,
                            "New capture queued: {}",
                            path.display()
                        );
                        let _ = event_tx.send(entry.recording).await;
                    }
                }
                Ok(false) => {
                    tracing::debug!("Capture already queued: {}", path.display());
                }
                Err(e) => {
                    tracing::warn!("Failed to enqueue {}: {}", path.display(), e);
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}
