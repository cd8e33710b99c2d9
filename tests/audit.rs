//! Audit trail guarantees: mutations are audited before their results
//! are observable, reads are recorded eventually, write failures
//! escalate instead of proceeding unaudited, and the ledger is
//! append-only and queryable.

mod common;

use tempfile::TempDir;
use uuid::Uuid;

use common::{sample_recording, TestServer};
use scribeflow::domain::AuditEntry;
use scribeflow::error::{Classify, ErrorClass};
use scribeflow::server::audit::{AuditFilter, AuditLedger};
use scribeflow::server::ingest::IngestRequest;

#[tokio::test]
async fn mutating_actions_are_audited_before_the_ack() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(&temp).await;

    let (recording, audio) = sample_recording(Uuid::new_v4(), Uuid::new_v4());
    let id = recording.id;
    let owner = recording.owner_id;

    let ack = server
        .service
        .ingest(IngestRequest {
            recording,
            bytes: audio,
            ehr_requested: false,
            source_addr: Some("10.1.2.3".to_string()),
            agent: Some("scribeflow-mobile/2.0".to_string()),
        })
        .await
        .unwrap();
    assert!(ack.acknowledged);

    // By the time the caller holds the ack, the entry is queryable with
    // matching actor, resource and action
    let entries = server
        .audit
        .query(&AuditFilter {
            actor_id: Some(owner),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "recording.ingest");
    assert_eq!(entries[0].resource_id.as_deref(), Some(id.to_string().as_str()));
    assert_eq!(entries[0].source_addr.as_deref(), Some("10.1.2.3"));
}

#[tokio::test]
async fn every_pipeline_transition_leaves_an_audit_trail() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(&temp).await;

    let (recording, audio) = sample_recording(Uuid::new_v4(), Uuid::new_v4());
    let clinic = recording.clinic_id;
    let id = recording.id;

    server
        .service
        .ingest(IngestRequest {
            recording,
            bytes: audio,
            ehr_requested: false,
            source_addr: None,
            agent: None,
        })
        .await
        .unwrap();
    let record = server.stub_runner().process(id).await.unwrap();
    assert!(record.is_terminal());

    let transitions = server
        .audit
        .query(&AuditFilter {
            clinic_id: Some(clinic),
            resource_type: Some("pipeline_record".to_string()),
            ..Default::default()
        })
        .unwrap();

    // received → transcribing → transcribed → drafting → drafted
    assert_eq!(transitions.len(), 4);
    assert!(transitions.iter().all(|e| e.action == "pipeline.transition"));

    // Each entry carries before/after snapshots of the state
    let first = &transitions[0];
    assert_eq!(first.before.as_ref().unwrap()["state"], "received");
    assert_eq!(first.after.as_ref().unwrap()["state"], "transcribing");
}

#[tokio::test]
async fn status_reads_are_recorded_eventually() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(&temp).await;

    let (recording, audio) = sample_recording(Uuid::new_v4(), Uuid::new_v4());
    let id = recording.id;

    server
        .service
        .ingest(IngestRequest {
            recording,
            bytes: audio,
            ehr_requested: false,
            source_addr: None,
            agent: None,
        })
        .await
        .unwrap();

    let reader = Uuid::new_v4();
    server.tracker.status(id, Some(reader)).await.unwrap();

    // Off the critical path but guaranteed to land
    server.audit.flush_reads().await;

    let reads = server
        .audit
        .query(&AuditFilter {
            actor_id: Some(reader),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].action, "pipeline.status");
}

#[tokio::test]
async fn failed_write_pauses_the_scope_until_recovery() {
    let temp = TempDir::new().unwrap();
    let ledger = AuditLedger::open(&temp.path().join("audit.db")).unwrap();

    let clinic = Uuid::new_v4();
    let entry = AuditEntry::new("recording.ingest", "recording")
        .actor(Uuid::new_v4())
        .clinic(clinic);

    ledger.record(&entry).unwrap();

    // Re-inserting the same id violates the primary key: the write
    // fails, classifies as fatal, and pauses the clinic scope
    let err = ledger.record(&entry).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Fatal);

    // The ledger itself is reachable, so the gate probes and recovers;
    // a paused scope only reopens through a successful probe
    ledger.ensure_writable(Some(clinic)).unwrap();
    ledger
        .record(
            &AuditEntry::new("recording.ingest", "recording")
                .actor(Uuid::new_v4())
                .clinic(clinic),
        )
        .unwrap();
}

#[tokio::test]
async fn queries_filter_by_time_range_and_resource() {
    let temp = TempDir::new().unwrap();
    let ledger = AuditLedger::open(&temp.path().join("audit.db")).unwrap();

    let actor = Uuid::new_v4();
    let mut old = AuditEntry::new("draft.read", "draft").actor(actor);
    old.recorded_at = chrono::Utc::now() - chrono::Duration::days(90);
    ledger.record(&old).unwrap();
    ledger
        .record(&AuditEntry::new("recording.ingest", "recording").actor(actor))
        .unwrap();

    let recent = ledger
        .query(&AuditFilter {
            actor_id: Some(actor),
            from: Some(chrono::Utc::now() - chrono::Duration::days(7)),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].resource_type, "recording");

    let drafts = ledger
        .query(&AuditFilter {
            actor_id: Some(actor),
            resource_type: Some("draft".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].action, "draft.read");

    // Results come back in time order
    let all = ledger
        .query(&AuditFilter {
            actor_id: Some(actor),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].recorded_at < all[1].recorded_at);
}
