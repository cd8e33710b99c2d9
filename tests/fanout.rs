//! Fan-out authorization and delivery guarantees: scope filtering,
//! non-blocking delivery, and reconnect-then-requery equivalence.

mod common;

use tempfile::TempDir;
use uuid::Uuid;

use common::{sample_recording, TestServer};
use scribeflow::domain::StatusEvent;
use scribeflow::server::fanout::Identity;
use scribeflow::server::ingest::IngestRequest;

async fn ingest(server: &TestServer) -> scribeflow::domain::Recording {
    let (recording, audio) = sample_recording(Uuid::new_v4(), Uuid::new_v4());
    server
        .service
        .ingest(IngestRequest {
            recording: recording.clone(),
            bytes: audio,
            ehr_requested: false,
            source_addr: None,
            agent: None,
        })
        .await
        .unwrap();
    recording
}

#[tokio::test]
async fn events_stay_inside_the_authorization_scope() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(&temp).await;

    let recording = ingest(&server).await;

    let mut owner = server.fanout.subscribe(Identity {
        user_id: recording.owner_id,
        clinic_id: Uuid::new_v4(),
    });
    let mut colleague = server.fanout.subscribe(Identity {
        user_id: Uuid::new_v4(),
        clinic_id: recording.clinic_id,
    });
    let mut other_clinic = server.fanout.subscribe(Identity {
        user_id: Uuid::new_v4(),
        clinic_id: Uuid::new_v4(),
    });

    server.stub_runner().process(recording.id).await.unwrap();

    assert!(owner.try_recv().is_some());
    assert!(colleague.try_recv().is_some());

    // Not even transiently: the outsider's buffer never saw an event
    assert!(other_clinic.try_recv().is_none());
}

#[tokio::test]
async fn slow_subscriber_never_blocks_the_pipeline() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(&temp).await;
    let recording = ingest(&server).await;

    // Subscribe and never read: the bounded buffer fills and overflow
    // is dropped, while processing runs to completion
    let _stalled = server.fanout.subscribe(Identity {
        user_id: recording.owner_id,
        clinic_id: recording.clinic_id,
    });

    let record = server.stub_runner().process(recording.id).await.unwrap();
    assert!(record.is_terminal());
}

#[tokio::test]
async fn reconnect_and_requery_sees_the_same_terminal_stage() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(&temp).await;
    let recording = ingest(&server).await;

    let identity = Identity {
        user_id: recording.owner_id,
        clinic_id: recording.clinic_id,
    };

    // One client stays connected for the whole run
    let mut connected = server.fanout.subscribe(identity);

    // The other disconnects before processing starts
    let disconnected = server.fanout.subscribe(identity);
    drop(disconnected);

    server.stub_runner().process(recording.id).await.unwrap();

    let mut last_live_stage = None;
    while let Some(event) = connected.try_recv() {
        if let StatusEvent::ProcessingStatus { stage, .. } = event {
            last_live_stage = Some(stage);
        }
    }

    // Reconnect path: the status query is the source of truth and
    // reports exactly the terminal stage the live client saw last
    let view = server.tracker.status(recording.id, None).await.unwrap();
    assert_eq!(Some(view.stage.clone()), last_live_stage);
    assert_eq!(view.stage, "drafted");
}

#[tokio::test]
async fn draft_ready_is_delivered_once_with_the_draft_id() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(&temp).await;
    let recording = ingest(&server).await;

    let mut subscription = server.fanout.subscribe(Identity {
        user_id: recording.owner_id,
        clinic_id: recording.clinic_id,
    });

    let record = server.stub_runner().process(recording.id).await.unwrap();

    let mut draft_events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        if let StatusEvent::DraftReady { draft_id, .. } = event {
            draft_events.push(draft_id);
        }
    }
    assert_eq!(draft_events.len(), 1);
    assert_eq!(Some(draft_events[0]), record.draft_id);
}
