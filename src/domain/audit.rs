//! Audit trail entries: who did what to what, when.
//!
//! Entries are immutable facts. Application code can append and query
//! them; nothing in the public contract updates or deletes one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One access or mutation of a protected resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,

    /// Absent for unauthenticated failures.
    pub actor_id: Option<Uuid>,

    pub clinic_id: Option<Uuid>,

    /// Verb, e.g. `recording.ingest`, `draft.read`, `pipeline.retry`.
    pub action: String,

    /// e.g. `recording`, `pipeline_record`, `draft`.
    pub resource_type: String,

    pub resource_id: Option<String>,

    /// Resource snapshot before a mutation.
    pub before: Option<serde_json::Value>,

    /// Resource snapshot after a mutation.
    pub after: Option<serde_json::Value>,

    /// Network address the action originated from.
    pub source_addr: Option<String>,

    /// Client software identifier.
    pub agent: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: None,
            clinic_id: None,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            before: None,
            after: None,
            source_addr: None,
            agent: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn clinic(mut self, clinic_id: Uuid) -> Self {
        self.clinic_id = Some(clinic_id);
        self
    }

    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn before(mut self, snapshot: serde_json::Value) -> Self {
        self.before = Some(snapshot);
        self
    }

    pub fn after(mut self, snapshot: serde_json::Value) -> Self {
        self.after = Some(snapshot);
        self
    }

    pub fn source(mut self, addr: impl Into<String>) -> Self {
        self.source_addr = Some(addr.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_fields() {
        let actor = Uuid::new_v4();
        let clinic = Uuid::new_v4();
        let entry = AuditEntry::new("recording.ingest", "recording")
            .actor(actor)
            .clinic(clinic)
            .resource("rec-1")
            .after(serde_json::json!({"stage": "received"}))
            .source("10.0.0.7")
            .agent("scribeflow-mobile/1.4");

        assert_eq!(entry.actor_id, Some(actor));
        assert_eq!(entry.clinic_id, Some(clinic));
        assert_eq!(entry.resource_id.as_deref(), Some("rec-1"));
        assert!(entry.before.is_none());
        assert!(entry.after.is_some());
    }
}
