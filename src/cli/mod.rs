//! Command-line interface for scribeflow.
//!
//! Device-side commands (capture, sync, queue, requeue) operate on the
//! local capture queue; status and audit are operator tools reading the
//! server data directory directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adapters::HttpIngestClient;
use crate::capture::{
    CaptureQueue, CaptureWatcher, Connectivity, DeviceIdentity, StateChange, UploadSynchronizer,
    WatcherConfig,
};
use crate::config::Config;
use crate::domain::Recording;
use crate::server::audit::{AuditFilter, AuditLedger};
use crate::server::store::{records_dir, RecordStore};

/// scribeflow - offline-first clinical dictation pipeline
#[derive(Parser, Debug)]
#[command(name = "scribeflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a finished capture for upload
    Capture {
        /// Audio file to queue
        file: PathBuf,

        /// Owning clinician id
        #[arg(long, env = "SCRIBEFLOW_OWNER")]
        owner: String,

        /// Clinic id
        #[arg(long, env = "SCRIBEFLOW_CLINIC")]
        clinic: String,

        /// Patient reference
        #[arg(long)]
        patient: Option<String>,

        /// Encounter reference
        #[arg(long)]
        encounter: Option<String>,

        /// Recorded duration in milliseconds
        #[arg(long, default_value = "0")]
        duration_ms: u64,
    },

    /// Watch the captures directory and queue finished recordings
    Watch {
        /// Owning clinician id
        #[arg(long, env = "SCRIBEFLOW_OWNER")]
        owner: String,

        /// Clinic id
        #[arg(long, env = "SCRIBEFLOW_CLINIC")]
        clinic: String,

        /// Scan the directory once instead of staying resident
        #[arg(long)]
        once: bool,
    },

    /// Drain the capture queue against the ingestion endpoint
    Sync {
        /// Run a single drain pass instead of staying resident
        #[arg(long)]
        once: bool,
    },

    /// Show the capture queue summary
    Queue,

    /// Manually retry an entry that ran out of automatic attempts
    Requeue {
        /// Recording ID (UUID)
        recording_id: String,
    },

    /// Check the pipeline status of a recording
    Status {
        /// Recording ID (UUID)
        recording_id: String,
    },

    /// Query the audit ledger (compliance role)
    Audit {
        /// Filter by actor id
        #[arg(long)]
        actor: Option<String>,

        /// Filter by clinic id
        #[arg(long)]
        clinic: Option<String>,

        /// Filter by resource type
        #[arg(long)]
        resource_type: Option<String>,

        /// Lower bound, RFC 3339
        #[arg(long)]
        from: Option<String>,

        /// Upper bound, RFC 3339
        #[arg(long)]
        to: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Capture {
                file,
                owner,
                clinic,
                patient,
                encounter,
                duration_ms,
            } => capture(file, &owner, &clinic, patient, encounter, duration_ms).await,
            Commands::Watch { owner, clinic, once } => watch(&owner, &clinic, once).await,
            Commands::Sync { once } => sync(once).await,
            Commands::Queue => queue_status().await,
            Commands::Requeue { recording_id } => requeue(&recording_id).await,
            Commands::Status { recording_id } => show_status(&recording_id).await,
            Commands::Audit {
                actor,
                clinic,
                resource_type,
                from,
                to,
            } => query_audit(actor, clinic, resource_type, from, to).await,
            Commands::Config => show_config(),
        }
    }
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid {what}: {value}"))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid RFC 3339 timestamp: {value}"))
}

async fn open_queue(config: &Config) -> Result<CaptureQueue> {
    Ok(CaptureQueue::open(&config.device.home.join("queue")).await?)
}

async fn capture(
    file: PathBuf,
    owner: &str,
    clinic: &str,
    patient: Option<String>,
    encounter: Option<String>,
    duration_ms: u64,
) -> Result<()> {
    let config = Config::load()?;
    let queue = open_queue(&config).await?;

    let bytes = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read capture: {}", file.display()))?;
    if bytes.is_empty() {
        bail!("Capture file is empty: {}", file.display());
    }

    let mut recording = Recording::capture(
        parse_uuid(owner, "owner id")?,
        parse_uuid(clinic, "clinic id")?,
        &bytes,
        duration_ms,
    );
    if let Some(patient) = patient {
        recording = recording.with_patient(patient);
    }
    if let Some(encounter) = encounter {
        recording = recording.with_encounter(encounter);
    }

    let id = recording.id;
    let enqueued = queue.enqueue(recording, file.clone()).await?;
    if enqueued.is_new() {
        queue.mark_state(id, StateChange::QueuedForUpload).await?;
        println!("Queued {} ({} bytes)", id, bytes.len());
    } else {
        println!("Already queued as {}", enqueued.entry().recording.id);
    }

    Ok(())
}

async fn watch(owner: &str, clinic: &str, once: bool) -> Result<()> {
    let config = Config::load()?;
    let queue = Arc::new(open_queue(&config).await?);

    let identity = DeviceIdentity {
        owner_id: parse_uuid(owner, "owner id")?,
        clinic_id: parse_uuid(clinic, "clinic id")?,
    };

    let captures_dir = config.device.captures_dir.clone();
    tokio::fs::create_dir_all(&captures_dir)
        .await
        .with_context(|| format!("Failed to create captures dir: {}", captures_dir.display()))?;

    let watcher = CaptureWatcher::new(WatcherConfig::new(captures_dir.clone()), identity);

    // Sweep whatever the recorder finished while we were not running
    let result = watcher.scan_once(&queue).await?;
    println!(
        "Scanned {}: {} new, {} already queued",
        captures_dir.display(),
        result.new_files,
        result.already_queued
    );
    if once {
        return Ok(());
    }

    let (mut events, handle) = watcher.watch(queue).await?;
    println!("Watching {} (ctrl-c to stop)", captures_dir.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(recording) => println!("Queued {}", recording.id),
                None => break,
            }
        }
    }

    handle.stop().await
}

async fn sync(once: bool) -> Result<()> {
    let config = Config::load()?;
    let queue = Arc::new(open_queue(&config).await?);

    let mut client = HttpIngestClient::new(config.server.base_url.clone());
    if let Ok(token) = std::env::var("SCRIBEFLOW_TOKEN") {
        client = client.with_auth_token(token);
    }

    // The CLI runs when the operator says so; treat the link as up.
    let connectivity = Connectivity::new(true);
    let synchronizer = UploadSynchronizer::new(
        queue,
        Arc::new(client),
        connectivity,
        config.device.retry.clone(),
        config.device.upload_concurrency,
    );

    if once {
        let report = synchronizer.drain_once().await?;
        println!(
            "Attempted {} | acknowledged {} | failed {} | rejected {}",
            report.attempted, report.acknowledged, report.failed, report.rejected
        );
        let attention = synchronizer.attention_needed().await?;
        if !attention.is_empty() {
            println!("{} entries need attention:", attention.len());
            for entry in attention {
                println!(
                    "  {}  {:?}  {}",
                    entry.recording.id,
                    entry.state,
                    entry.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(()).await;
    });

    println!("Syncing to {} (ctrl-c to stop)", config.server.base_url);
    synchronizer.run(shutdown_rx).await
}

async fn queue_status() -> Result<()> {
    let config = Config::load()?;
    let queue = open_queue(&config).await?;

    let status = queue.status().await?;
    println!("Capture queue ({} entries)", status.total());
    println!("  captured:      {}", status.captured);
    println!("  queued:        {}", status.queued);
    println!("  uploading:     {}", status.uploading);
    println!("  failed:        {}", status.failed);
    println!("  rejected:      {}", status.rejected);
    println!("  acknowledged:  {}", status.acknowledged);

    let attention = queue.list_attention(config.device.retry.max_attempts).await?;
    if !attention.is_empty() {
        println!("\nNeeds attention:");
        for entry in attention {
            println!(
                "  {}  {:?}  {}",
                entry.recording.id,
                entry.state,
                entry.last_error.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}

async fn requeue(recording_id: &str) -> Result<()> {
    let config = Config::load()?;
    let queue = open_queue(&config).await?;

    let id = parse_uuid(recording_id, "recording id")?;
    let entry = queue.mark_state(id, StateChange::Requeued).await?;
    println!("Requeued {} ({:?})", id, entry.state);
    Ok(())
}

async fn show_status(recording_id: &str) -> Result<()> {
    let config = Config::load()?;
    let id = parse_uuid(recording_id, "recording id")?;

    let store = RecordStore::open(records_dir(&config.server.data_dir)).await?;
    let Some(record) = store.load(id).await? else {
        bail!("No pipeline record for {id}");
    };

    println!("Recording {}", id);
    println!("  state:         {}", record.state_label());
    println!("  stage version: {}", record.stage_version);
    if let Some(error) = &record.last_error {
        println!("  last error:    {}", error);
    }
    if let Some(draft_id) = record.draft_id {
        println!("  draft:         {}", draft_id);
    }
    Ok(())
}

async fn query_audit(
    actor: Option<String>,
    clinic: Option<String>,
    resource_type: Option<String>,
    from: Option<String>,
    to: Option<String>,
) -> Result<()> {
    let config = Config::load()?;
    let ledger = AuditLedger::open(&config.server.data_dir.join("audit.db"))?;

    let filter = AuditFilter {
        actor_id: actor.as_deref().map(|v| parse_uuid(v, "actor id")).transpose()?,
        clinic_id: clinic
            .as_deref()
            .map(|v| parse_uuid(v, "clinic id"))
            .transpose()?,
        resource_type,
        from: from.as_deref().map(parse_time).transpose()?,
        to: to.as_deref().map(parse_time).transpose()?,
    };

    let entries = ledger.query(&filter)?;
    println!("{} entries", entries.len());
    for entry in entries {
        println!(
            "{}  {}  {}  {}  {}",
            entry.recorded_at.to_rfc3339(),
            entry.actor_id.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            entry.action,
            entry.resource_type,
            entry.resource_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    println!("{:#?}", config);
    Ok(())
}
