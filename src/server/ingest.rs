//! Ingestion endpoint: idempotent acceptance of uploaded recordings.
//!
//! The recording id is the idempotency key. A retried upload of an
//! already-accepted recording returns the existing acknowledgement
//! without touching storage, the tracker, or the audit ledger — which is
//! what makes at-least-once delivery from the device safe.
//!
//! The HTTP layer in front of this service is an external collaborator;
//! it decodes the request and hands the fields here.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{AuditEntry, IngestAck, Recording};
use crate::error::{Classify, ErrorClass};
use crate::server::audit::{AuditError, AuditLedger};
use crate::server::store::BlobStore;
use crate::server::tracker::{PipelineTracker, TrackerError};

/// One upload, as decoded by the HTTP layer.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub recording: Recording,
    pub bytes: Vec<u8>,
    /// Whether the clinician asked for EHR sync after drafting
    pub ehr_requested: bool,
    pub source_addr: Option<String>,
    pub agent: Option<String>,
}

/// Errors reported to the uploading client.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Payload corrupted in transit; the client must not retry as-is.
    #[error("content hash mismatch for recording {0}")]
    HashMismatch(Uuid),

    /// Blob storage trouble; the client's backoff schedule applies.
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl Classify for IngestError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::HashMismatch(_) => ErrorClass::Permanent,
            Self::Storage(_) => ErrorClass::Transient,
            Self::Audit(e) => e.class(),
            Self::Tracker(e) => e.class(),
        }
    }
}

/// Accepts recordings and hands them to the pipeline.
pub struct IngestionService {
    tracker: Arc<PipelineTracker>,
    blobs: Arc<dyn BlobStore>,
    audit: Arc<AuditLedger>,

    /// Asynchronous handoff to the transform runner; ingestion never
    /// blocks on processing.
    work_tx: mpsc::UnboundedSender<Uuid>,
}

impl IngestionService {
    /// Build the service plus the work queue the transform runner drains.
    pub fn new(
        tracker: Arc<PipelineTracker>,
        blobs: Arc<dyn BlobStore>,
        audit: Arc<AuditLedger>,
    ) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        (
            Self {
                tracker,
                blobs,
                audit,
                work_tx,
            },
            work_rx,
        )
    }

    /// Accept one upload. Safe to call any number of times with the same
    /// recording id.
    #[instrument(skip(self, request), fields(recording_id = %request.recording.id))]
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestAck, IngestError> {
        let id = request.recording.id;

        // Fast path for retries: already accepted, nothing to redo.
        if let Some(existing) = self.tracker.get(id).await? {
            debug!(stage = %existing.state_label(), "Duplicate upload, returning existing ack");
            return Ok(IngestAck {
                acknowledged: true,
                recording_id: id,
                current_stage: existing.state_label(),
            });
        }

        // Integrity check before anything durable happens.
        if !request.recording.verify(&request.bytes) {
            warn!("Rejecting upload: content hash mismatch");
            return Err(IngestError::HashMismatch(id));
        }

        let clinic_id = request.recording.clinic_id;
        self.audit.ensure_writable(Some(clinic_id))?;

        self.blobs
            .put(id, &request.bytes)
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        // Audit precedes the commit that makes the recording visible.
        let mut entry = AuditEntry::new("recording.ingest", "recording")
            .actor(request.recording.owner_id)
            .clinic(clinic_id)
            .resource(id.to_string())
            .after(serde_json::json!({
                "byteSize": request.recording.byte_size,
                "durationMs": request.recording.duration_ms,
                "contentHash": request.recording.content_hash,
                "patientRef": request.recording.patient_ref,
                "encounterRef": request.recording.encounter_ref,
            }));
        if let Some(addr) = &request.source_addr {
            entry = entry.source(addr.clone());
        }
        if let Some(agent) = &request.agent {
            entry = entry.agent(agent.clone());
        }
        self.audit.record(&entry)?;

        let created = self
            .tracker
            .create(request.recording, request.ehr_requested)
            .await?;
        let record = created.record();

        if created.is_new() {
            info!("Recording accepted, queued for processing");
            // Receiver gone only at shutdown; the record is durable and
            // restart recovery will pick it up.
            let _ = self.work_tx.send(id);
        }

        Ok(IngestAck {
            acknowledged: true,
            recording_id: id,
            current_stage: record.state_label(),
        })
    }
}

/// Glue for driving the service from an in-process client (tests, CLI
/// demos): maps service errors onto the transport's transient/permanent
/// split the way the HTTP layer does.
pub mod local {
    use async_trait::async_trait;

    use super::*;
    use crate::adapters::{IngestClient, UploadError};

    /// In-process ingest client wrapping the service directly.
    pub struct LocalIngestClient {
        service: Arc<IngestionService>,
        ehr_requested: bool,
    }

    impl LocalIngestClient {
        pub fn new(service: Arc<IngestionService>) -> Self {
            Self {
                service,
                ehr_requested: false,
            }
        }

        pub fn with_ehr_sync(mut self, ehr_requested: bool) -> Self {
            self.ehr_requested = ehr_requested;
            self
        }
    }

    #[async_trait]
    impl IngestClient for LocalIngestClient {
        fn name(&self) -> &str {
            "local"
        }

        async fn upload(
            &self,
            recording: &Recording,
            audio: &[u8],
        ) -> Result<IngestAck, UploadError> {
            let request = IngestRequest {
                recording: recording.clone(),
                bytes: audio.to_vec(),
                ehr_requested: self.ehr_requested,
                source_addr: None,
                agent: Some("scribeflow-local".to_string()),
            };

            self.service.ingest(request).await.map_err(|e| {
                if e.class().is_retriable() || e.class() == ErrorClass::Fatal {
                    UploadError::Transient(e.to_string())
                } else {
                    UploadError::Permanent(e.to_string())
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::server::audit::AuditFilter;
    use crate::server::fanout::SubscriberRegistry;
    use crate::server::store::{BlobError, FsBlobStore, RecordStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    async fn test_service(
        temp: &TempDir,
    ) -> (IngestionService, Arc<AuditLedger>, Arc<PipelineTracker>) {
        let store = RecordStore::open(temp.path().join("records")).await.unwrap();
        let fanout = SubscriberRegistry::new(16);
        let audit = AuditLedger::open(&temp.path().join("audit.db")).unwrap();
        let tracker = Arc::new(PipelineTracker::new(
            store,
            fanout,
            audit.clone(),
            RetryPolicy::stage_default(),
        ));
        let blobs = Arc::new(FsBlobStore::open(temp.path().join("blobs")).await.unwrap());
        let (service, _work_rx) = IngestionService::new(tracker.clone(), blobs, audit.clone());
        (service, audit, tracker)
    }

    fn request(recording: Recording, bytes: &[u8]) -> IngestRequest {
        IngestRequest {
            recording,
            bytes: bytes.to_vec(),
            ehr_requested: false,
            source_addr: Some("10.0.0.9".to_string()),
            agent: Some("scribeflow-mobile/1.4".to_string()),
        }
    }

    #[tokio::test]
    async fn first_upload_creates_record_and_audit_entry() {
        let temp = TempDir::new().unwrap();
        let (service, audit, tracker) = test_service(&temp).await;

        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"audio", 900);
        let id = recording.id;

        let ack = service.ingest(request(recording, b"audio")).await.unwrap();
        assert!(ack.acknowledged);
        assert_eq!(ack.current_stage, "received");

        let record = tracker.get(id).await.unwrap().unwrap();
        assert_eq!(record.stage_version, 1);

        let entries = audit
            .query(&AuditFilter {
                clinic_id: Some(record.clinic_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "recording.ingest");
        assert_eq!(entries[0].resource_id.as_deref(), Some(id.to_string().as_str()));
    }

    #[tokio::test]
    async fn retried_upload_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let (service, audit, tracker) = test_service(&temp).await;

        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"audio", 900);
        let clinic = recording.clinic_id;
        let id = recording.id;

        for _ in 0..4 {
            let ack = service
                .ingest(request(recording.clone(), b"audio"))
                .await
                .unwrap();
            assert_eq!(ack.recording_id, id);
        }

        // Exactly one record and one ingest audit entry
        let record = tracker.get(id).await.unwrap().unwrap();
        assert_eq!(record.stage_version, 1);

        let entries = audit
            .query(&AuditFilter {
                clinic_id: Some(clinic),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn corrupted_payload_is_rejected_permanently() {
        let temp = TempDir::new().unwrap();
        let (service, _audit, tracker) = test_service(&temp).await;

        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"audio", 900);
        let id = recording.id;

        let err = service
            .ingest(request(recording, b"corrupted in transit"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::HashMismatch(_)));
        assert_eq!(err.class(), ErrorClass::Permanent);

        // Nothing was created
        assert!(tracker.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storage_failure_is_reported_transient() {
        struct BrokenBlobs;

        #[async_trait]
        impl BlobStore for BrokenBlobs {
            async fn put(&self, _id: Uuid, _bytes: &[u8]) -> Result<(), BlobError> {
                Err(BlobError::Unavailable("disk on fire".into()))
            }

            async fn get(&self, id: Uuid) -> Result<Vec<u8>, BlobError> {
                Err(BlobError::NotFound(id))
            }
        }

        let temp = TempDir::new().unwrap();
        let store = RecordStore::open(temp.path().join("records")).await.unwrap();
        let fanout = SubscriberRegistry::new(16);
        let audit = AuditLedger::open(&temp.path().join("audit.db")).unwrap();
        let tracker = Arc::new(PipelineTracker::new(
            store,
            fanout,
            audit.clone(),
            RetryPolicy::stage_default(),
        ));
        let (service, _work_rx) =
            IngestionService::new(tracker, Arc::new(BrokenBlobs), audit);

        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"audio", 900);
        let err = service.ingest(request(recording, b"audio")).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn new_recording_is_handed_to_the_runner_queue() {
        let temp = TempDir::new().unwrap();
        let store = RecordStore::open(temp.path().join("records")).await.unwrap();
        let fanout = SubscriberRegistry::new(16);
        let audit = AuditLedger::open(&temp.path().join("audit.db")).unwrap();
        let tracker = Arc::new(PipelineTracker::new(
            store,
            fanout,
            audit.clone(),
            RetryPolicy::stage_default(),
        ));
        let blobs = Arc::new(FsBlobStore::open(temp.path().join("blobs")).await.unwrap());
        let (service, mut work_rx) = IngestionService::new(tracker, blobs, audit);

        let recording = Recording::capture(Uuid::new_v4(), Uuid::new_v4(), b"audio", 900);
        let id = recording.id;

        service.ingest(request(recording.clone(), b"audio")).await.unwrap();
        assert_eq!(work_rx.recv().await, Some(id));

        // A duplicate does not enqueue again
        service.ingest(request(recording, b"audio")).await.unwrap();
        assert!(work_rx.try_recv().is_err());
    }
}
