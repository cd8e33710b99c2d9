//! Upload synchronizer: drains the capture queue when the network allows.
//!
//! Entries are taken oldest-capture-first so the staleness of unsynced
//! clinical data stays bounded. Each attempt runs under a concurrency
//! bound, is aborted if connectivity drops mid-flight, and reschedules
//! itself with exponential backoff on transient failures. Nothing is ever
//! deleted on failure; entries that exhaust the budget are surfaced for
//! manual intervention.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{IngestClient, UploadError};
use crate::capture::connectivity::Connectivity;
use crate::capture::queue::{CaptureQueue, QueueEntry, StateChange};
use crate::config::RetryPolicy;

/// Outcome summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub rejected: usize,
    pub aborted: usize,
}

/// Drains the capture queue against the ingestion endpoint.
pub struct UploadSynchronizer {
    queue: Arc<CaptureQueue>,
    client: Arc<dyn IngestClient>,
    connectivity: Connectivity,
    policy: RetryPolicy,
    limiter: Arc<Semaphore>,
}

impl UploadSynchronizer {
    pub fn new(
        queue: Arc<CaptureQueue>,
        client: Arc<dyn IngestClient>,
        connectivity: Connectivity,
        policy: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            client,
            connectivity,
            policy,
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// One pass over everything currently due. Returns immediately when
    /// offline.
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainReport> {
        if !self.connectivity.is_online() {
            debug!("Skipping drain: offline");
            return Ok(DrainReport::default());
        }

        let due = self
            .queue
            .list_due(Utc::now(), self.policy.max_attempts)
            .await?;
        if due.is_empty() {
            return Ok(DrainReport::default());
        }

        info!(entries = due.len(), "Draining capture queue");

        let mut tasks = JoinSet::new();
        for entry in due {
            let permit = self.limiter.clone().acquire_owned().await?;
            let queue = self.queue.clone();
            let client = self.client.clone();
            let connectivity = self.connectivity.clone();
            let policy = self.policy.clone();

            tasks.spawn(async move {
                let _permit = permit;
                upload_entry(queue, client, connectivity, policy, entry).await
            });
        }

        let mut report = DrainReport::default();
        while let Some(joined) = tasks.join_next().await {
            report.attempted += 1;
            match joined {
                Ok(AttemptOutcome::Acknowledged) => report.acknowledged += 1,
                Ok(AttemptOutcome::Failed) => report.failed += 1,
                Ok(AttemptOutcome::Rejected) => report.rejected += 1,
                Ok(AttemptOutcome::Aborted) => report.aborted += 1,
                Ok(AttemptOutcome::Skipped) => report.attempted -= 1,
                Err(e) => {
                    error!(error = %e, "Upload task panicked");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run until the shutdown channel fires: wait for connectivity, drain,
    /// and repeat on a short tick so freshly due retries get picked up.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Synchronizer stopping");
                    return Ok(());
                }
                _ = self.connectivity.wait_until_online() => {}
            }

            if let Err(e) = self.drain_once().await {
                warn!(error = %e, "Drain pass failed");
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Synchronizer stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    /// Entries needing manual intervention after the automatic budget.
    pub async fn attention_needed(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.queue.list_attention(self.policy.max_attempts).await?)
    }

    /// User-initiated retry of an entry that ran out of budget.
    pub async fn requeue(&self, id: Uuid) -> Result<QueueEntry> {
        Ok(self.queue.mark_state(id, StateChange::Requeued).await?)
    }
}

enum AttemptOutcome {
    Acknowledged,
    Failed,
    Rejected,
    Aborted,
    /// Entry changed state under us before the attempt started
    Skipped,
}

async fn upload_entry(
    queue: Arc<CaptureQueue>,
    client: Arc<dyn IngestClient>,
    connectivity: Connectivity,
    policy: RetryPolicy,
    entry: QueueEntry,
) -> AttemptOutcome {
    let id = entry.recording.id;

    // Claim the entry; a parallel drain pass may have beaten us to it.
    let entry = match queue.mark_state(id, StateChange::Uploading).await {
        Ok(entry) => entry,
        Err(e) => {
            debug!(recording_id = %id, error = %e, "Skipping entry");
            return AttemptOutcome::Skipped;
        }
    };

    let audio = match tokio::fs::read(&entry.media_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(recording_id = %id, error = %e, "Cannot read media file");
            return fail_entry(&queue, &policy, &entry, format!("media unreadable: {e}")).await;
        }
    };

    tokio::select! {
        result = client.upload(&entry.recording, &audio) => match result {
            Ok(ack) => {
                match queue.mark_state(id, StateChange::Acknowledged).await {
                    Ok(_) => {
                        info!(
                            recording_id = %id,
                            stage = %ack.current_stage,
                            "Upload acknowledged"
                        );
                        AttemptOutcome::Acknowledged
                    }
                    Err(e) => {
                        // The server has the bytes; the local mark will be
                        // retried because the entry replays as interrupted.
                        error!(recording_id = %id, error = %e, "Failed to mark acknowledged");
                        AttemptOutcome::Failed
                    }
                }
            }
            Err(UploadError::Transient(reason)) => {
                fail_entry(&queue, &policy, &entry, reason).await
            }
            Err(UploadError::Permanent(reason)) => {
                error!(recording_id = %id, reason = %reason, "Upload rejected permanently");
                match queue.mark_state(id, StateChange::Rejected { reason }).await {
                    Ok(_) => AttemptOutcome::Rejected,
                    Err(e) => {
                        error!(recording_id = %id, error = %e, "Failed to mark rejected");
                        AttemptOutcome::Failed
                    }
                }
            }
        },
        _ = connectivity.wait_until_offline() => {
            // Abort cleanly; the entry must not stay in Uploading.
            warn!(recording_id = %id, "Connectivity lost mid-upload, aborting");
            let change = StateChange::UploadFailed {
                error: "connectivity lost mid-upload".to_string(),
                next_retry_at: Utc::now(),
            };
            if let Err(e) = queue.mark_state(id, change).await {
                error!(recording_id = %id, error = %e, "Failed to record aborted upload");
            }
            AttemptOutcome::Aborted
        }
    }
}

async fn fail_entry(
    queue: &CaptureQueue,
    policy: &RetryPolicy,
    entry: &QueueEntry,
    reason: String,
) -> AttemptOutcome {
    let id = entry.recording.id;
    let next_retry_at = Utc::now()
        + chrono::Duration::from_std(policy.jittered_delay(entry.attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());

    if !policy.should_retry(entry.attempts) {
        warn!(
            recording_id = %id,
            attempts = entry.attempts,
            reason = %reason,
            "Retry budget exhausted, entry needs attention"
        );
    } else {
        debug!(
            recording_id = %id,
            attempt = entry.attempts,
            next_retry_at = %next_retry_at,
            reason = %reason,
            "Upload failed, retry scheduled"
        );
    }

    let change = StateChange::UploadFailed {
        error: reason,
        next_retry_at,
    };
    match queue.mark_state(id, change).await {
        Ok(_) => AttemptOutcome::Failed,
        Err(e) => {
            error!(recording_id = %id, error = %e, "Failed to record upload failure");
            AttemptOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::capture::queue::UploadState;
    use crate::domain::{IngestAck, Recording};

    /// Scripted ingest client: pops one outcome per upload call.
    struct ScriptedClient {
        outcomes: Mutex<VecDeque<Result<(), UploadError>>>,
    }

    impl ScriptedClient {
        fn new(outcomes: Vec<Result<(), UploadError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
            }
        }
    }

    #[async_trait]
    impl IngestClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn upload(
            &self,
            recording: &Recording,
            _audio: &[u8],
        ) -> Result<IngestAck, UploadError> {
            let next = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(UploadError::Transient("script exhausted".into())));
            next.map(|_| IngestAck {
                acknowledged: true,
                recording_id: recording.id,
                current_stage: "received".to_string(),
            })
        }
    }

    async fn queued_entry(queue: &CaptureQueue, dir: &TempDir) -> Recording {
        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"payload", 1000);
        let media = dir.path().join(format!("{}.m4a", recording.id));
        tokio::fs::write(&media, b"payload").await.unwrap();
        queue.enqueue(recording.clone(), media).await.unwrap();
        queue
            .mark_state(recording.id, StateChange::QueuedForUpload)
            .await
            .unwrap();
        recording
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn successful_upload_acknowledges_entry() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(CaptureQueue::open(temp.path()).await.unwrap());
        let recording = queued_entry(&queue, &temp).await;

        let connectivity = Connectivity::new(true);
        let sync = UploadSynchronizer::new(
            queue.clone(),
            Arc::new(ScriptedClient::new(vec![Ok(())])),
            connectivity,
            fast_policy(8),
            2,
        );

        let report = sync.drain_once().await.unwrap();
        assert_eq!(report.acknowledged, 1);

        let entry = queue.get(recording.id).await.unwrap().unwrap();
        assert_eq!(entry.state, UploadState::Acknowledged);
    }

    #[tokio::test]
    async fn offline_drain_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(CaptureQueue::open(temp.path()).await.unwrap());
        let recording = queued_entry(&queue, &temp).await;

        let sync = UploadSynchronizer::new(
            queue.clone(),
            Arc::new(ScriptedClient::new(vec![Ok(())])),
            Connectivity::new(false),
            fast_policy(8),
            2,
        );

        let report = sync.drain_once().await.unwrap();
        assert_eq!(report, DrainReport::default());

        let entry = queue.get(recording.id).await.unwrap().unwrap();
        assert_eq!(entry.state, UploadState::QueuedForUpload);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(CaptureQueue::open(temp.path()).await.unwrap());
        let recording = queued_entry(&queue, &temp).await;

        let sync = UploadSynchronizer::new(
            queue.clone(),
            Arc::new(ScriptedClient::new(vec![Err(UploadError::Transient(
                "503".into(),
            ))])),
            Connectivity::new(true),
            fast_policy(8),
            2,
        );

        let report = sync.drain_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let entry = queue.get(recording.id).await.unwrap().unwrap();
        assert_eq!(entry.state, UploadState::UploadFailed);
        assert_eq!(entry.attempts, 1);
        assert!(entry.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(CaptureQueue::open(temp.path()).await.unwrap());
        let recording = queued_entry(&queue, &temp).await;

        let sync = UploadSynchronizer::new(
            queue.clone(),
            Arc::new(ScriptedClient::new(vec![Err(UploadError::Permanent(
                "hash mismatch".into(),
            ))])),
            Connectivity::new(true),
            fast_policy(8),
            2,
        );

        let report = sync.drain_once().await.unwrap();
        assert_eq!(report.rejected, 1);

        let entry = queue.get(recording.id).await.unwrap().unwrap();
        assert_eq!(entry.state, UploadState::Rejected);
        // Rejected entries are surfaced, not due
        assert!(queue.list_due(Utc::now(), 8).await.unwrap().is_empty());
        assert_eq!(queue.list_attention(8).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_until_budget_then_surfaces() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(CaptureQueue::open(temp.path()).await.unwrap());
        let recording = queued_entry(&queue, &temp).await;

        let sync = UploadSynchronizer::new(
            queue.clone(),
            Arc::new(ScriptedClient::new(vec![
                Err(UploadError::Transient("timeout".into())),
                Err(UploadError::Transient("timeout".into())),
                Err(UploadError::Transient("timeout".into())),
            ])),
            Connectivity::new(true),
            fast_policy(3),
            1,
        );

        for _ in 0..3 {
            sync.drain_once().await.unwrap();
        }

        let entry = queue.get(recording.id).await.unwrap().unwrap();
        assert_eq!(entry.state, UploadState::UploadFailed);
        assert_eq!(entry.attempts, 3);
        assert!(entry.needs_attention(3));

        // Out of budget: further drains do not touch it
        let report = sync.drain_once().await.unwrap();
        assert_eq!(report.attempted, 0);

        // Manual requeue puts it back on the path
        sync.requeue(recording.id).await.unwrap();
        let entry = queue.get(recording.id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.state, UploadState::QueuedForUpload);
    }

    #[tokio::test]
    async fn connectivity_drop_aborts_in_flight_upload() {
        struct StallForever;

        #[async_trait]
        impl IngestClient for StallForever {
            fn name(&self) -> &str {
                "stall"
            }

            async fn upload(
                &self,
                _recording: &Recording,
                _audio: &[u8],
            ) -> Result<IngestAck, UploadError> {
                std::future::pending().await
            }
        }

        let temp = TempDir::new().unwrap();
        let queue = Arc::new(CaptureQueue::open(temp.path()).await.unwrap());
        let recording = queued_entry(&queue, &temp).await;

        let connectivity = Connectivity::new(true);
        let sync = UploadSynchronizer::new(
            queue.clone(),
            Arc::new(StallForever),
            connectivity.clone(),
            fast_policy(8),
            1,
        );

        let drain = tokio::spawn(async move { sync.drain_once().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        connectivity.set_offline();

        let report = tokio::time::timeout(Duration::from_secs(2), drain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.aborted, 1);

        // Never left in Uploading
        let entry = queue.get(recording.id).await.unwrap().unwrap();
        assert_eq!(entry.state, UploadState::UploadFailed);
    }
}
