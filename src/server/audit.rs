//! Append-only audit ledger backed by SQLite.
//!
//! Mutating actions write through `record` synchronously, before the
//! action's result becomes observable. Reads on protected resources go
//! through `record_read`, which queues the entry for a background writer
//! that retries until the write lands; the entry is never dropped.
//!
//! A failed synchronous write escalates instead of proceeding unaudited:
//! the affected clinic scope is paused and `ensure_writable` keeps
//! rejecting mutating actions until the ledger is reachable again.
//!
//! The public contract has no update or delete; entries are immutable
//! facts once written.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::AuditEntry;
use crate::error::{Classify, ErrorClass};

/// Errors from the ledger.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The ledger cannot currently take writes. Mutating actions in the
    /// affected scope must not proceed.
    #[error("audit ledger unavailable: {0}")]
    Unavailable(String),

    /// Mutations for this scope are paused after an earlier write failure.
    #[error("mutating actions paused for scope until audit ledger recovers")]
    ScopePaused,

    #[error("audit query failed: {0}")]
    Query(String),
}

impl Classify for AuditError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) | Self::ScopePaused => ErrorClass::Fatal,
            Self::Query(_) => ErrorClass::Transient,
        }
    }
}

/// Query filter for compliance review.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor_id: Option<Uuid>,
    pub clinic_id: Option<Uuid>,
    pub resource_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Append-only, queryable audit ledger.
pub struct AuditLedger {
    conn: Mutex<Connection>,

    /// Clinic scopes with mutating actions paused after a write failure.
    /// `None` is the scope of entries without a clinic.
    paused: Mutex<HashSet<Option<Uuid>>>,

    read_tx: mpsc::UnboundedSender<AuditEntry>,

    /// Read entries queued but not yet durably written
    pending_reads: AtomicU64,
}

impl AuditLedger {
    /// Open (or create) the ledger database and start the background
    /// writer for read-access entries.
    pub fn open(path: &Path) -> Result<Arc<Self>, AuditError> {
        let conn = Connection::open(path)
            .map_err(|e| AuditError::Unavailable(e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id            TEXT PRIMARY KEY,
                actor_id      TEXT,
                clinic_id     TEXT,
                action        TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id   TEXT,
                before_json   TEXT,
                after_json    TEXT,
                source_addr   TEXT,
                agent         TEXT,
                recorded_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_recorded_at ON audit_log (recorded_at);
            CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log (actor_id);
            CREATE INDEX IF NOT EXISTS idx_audit_clinic ON audit_log (clinic_id);
            "#,
        )
        .map_err(|e| AuditError::Unavailable(e.to_string()))?;

        let (read_tx, read_rx) = mpsc::unbounded_channel();

        let ledger = Arc::new(Self {
            conn: Mutex::new(conn),
            paused: Mutex::new(HashSet::new()),
            read_tx,
            pending_reads: AtomicU64::new(0),
        });

        tokio::spawn(read_writer(Arc::downgrade(&ledger), read_rx));

        Ok(ledger)
    }

    /// Synchronous, durable write for a mutating action. Must be called
    /// before the action's result becomes observable. Failure pauses the
    /// scope and is returned to the caller as fatal.
    pub fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        match self.write_entry(entry) {
            Ok(()) => {
                self.clear_pause(entry.clinic_id);
                Ok(())
            }
            Err(e) => {
                error!(
                    action = %entry.action,
                    clinic = ?entry.clinic_id,
                    error = %e,
                    "Audit write failed, pausing scope"
                );
                self.pause(entry.clinic_id);
                Err(AuditError::Unavailable(e.to_string()))
            }
        }
    }

    /// Queue an entry for a read access. Guaranteed eventually written;
    /// never blocks the read path, never dropped.
    pub fn record_read(&self, entry: AuditEntry) {
        self.pending_reads.fetch_add(1, Ordering::SeqCst);
        if self.read_tx.send(entry).is_err() {
            // Only possible during shutdown
            self.pending_reads.fetch_sub(1, Ordering::SeqCst);
            warn!("Read audit entry queued during shutdown");
        }
    }

    /// Gate consulted before any mutating action on a protected resource.
    /// While a scope is paused this probes the ledger and only clears the
    /// pause once a write lock can be taken again.
    pub fn ensure_writable(&self, clinic_id: Option<Uuid>) -> Result<(), AuditError> {
        let is_paused = {
            let paused = self.paused.lock().expect("audit pause set poisoned");
            paused.contains(&clinic_id) || paused.contains(&None)
        };
        if !is_paused {
            return Ok(());
        }

        match self.probe() {
            Ok(()) => {
                self.clear_pause(clinic_id);
                self.clear_pause(None);
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Audit ledger still unreachable");
                Err(AuditError::ScopePaused)
            }
        }
    }

    /// Compliance query: filter by actor, clinic, resource type and time
    /// range, ordered by record time.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let mut sql = String::from(
            "SELECT id, actor_id, clinic_id, action, resource_type, resource_id, \
             before_json, after_json, source_addr, agent, recorded_at \
             FROM audit_log WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();

        if let Some(actor_id) = filter.actor_id {
            sql.push_str(" AND actor_id = ?");
            params.push(actor_id.to_string());
        }
        if let Some(clinic_id) = filter.clinic_id {
            sql.push_str(" AND clinic_id = ?");
            params.push(clinic_id.to_string());
        }
        if let Some(resource_type) = &filter.resource_type {
            sql.push_str(" AND resource_type = ?");
            params.push(resource_type.clone());
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND recorded_at >= ?");
            params.push(from.to_rfc3339());
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND recorded_at <= ?");
            params.push(to.to_rfc3339());
        }
        sql.push_str(" ORDER BY recorded_at ASC");

        let conn = self.conn.lock().expect("audit connection poisoned");
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditError::Query(e.to_string()))?;

        let rows = stmt
            .query_map(params_from_iter(params.iter()), row_to_entry)
            .map_err(|e| AuditError::Query(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| AuditError::Query(e.to_string()))?);
        }
        Ok(entries)
    }

    /// Entries queued by `record_read` that have not landed yet.
    pub fn pending_reads(&self) -> u64 {
        self.pending_reads.load(Ordering::SeqCst)
    }

    /// Wait until all queued read entries are durably written.
    pub async fn flush_reads(&self) {
        while self.pending_reads() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn write_entry(&self, entry: &AuditEntry) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("audit connection poisoned");
        conn.execute(
            "INSERT INTO audit_log (
                id, actor_id, clinic_id, action, resource_type, resource_id,
                before_json, after_json, source_addr, agent, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                entry.id.to_string(),
                entry.actor_id.map(|v| v.to_string()),
                entry.clinic_id.map(|v| v.to_string()),
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.before.as_ref().map(|v| v.to_string()),
                entry.after.as_ref().map(|v| v.to_string()),
                entry.source_addr,
                entry.agent,
                entry.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Reachability probe: take and release a write lock without
    /// changing anything.
    fn probe(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("audit connection poisoned");
        conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;")
    }

    fn pause(&self, clinic_id: Option<Uuid>) {
        self.paused
            .lock()
            .expect("audit pause set poisoned")
            .insert(clinic_id);
    }

    fn clear_pause(&self, clinic_id: Option<Uuid>) {
        self.paused
            .lock()
            .expect("audit pause set poisoned")
            .remove(&clinic_id);
    }
}

/// Background writer for read-access entries: retry until success, never
/// drop. Exits when the ledger is gone.
async fn read_writer(
    ledger: Weak<AuditLedger>,
    mut rx: mpsc::UnboundedReceiver<AuditEntry>,
) {
    while let Some(entry) = rx.recv().await {
        let mut delay = Duration::from_millis(100);
        loop {
            let Some(ledger) = ledger.upgrade() else {
                return;
            };
            match ledger.write_entry(&entry) {
                Ok(()) => {
                    ledger.pending_reads.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Read audit write failed, retrying");
                    drop(ledger);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let parse_uuid = |value: Option<String>| value.and_then(|v| Uuid::parse_str(&v).ok());
    let parse_json =
        |value: Option<String>| value.and_then(|v| serde_json::from_str(&v).ok());

    let recorded_at: String = row.get(10)?;

    Ok(AuditEntry {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        actor_id: parse_uuid(row.get(1)?),
        clinic_id: parse_uuid(row.get(2)?),
        action: row.get(3)?,
        resource_type: row.get(4)?,
        resource_id: row.get(5)?,
        before: parse_json(row.get(6)?),
        after: parse_json(row.get(7)?),
        source_addr: row.get(8)?,
        agent: row.get(9)?,
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
