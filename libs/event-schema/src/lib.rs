//! Event schema registry for the Stratavore control plane.
//!
//! Defines the versioned envelope every published event is wrapped in, the
//! routing-key grammar used on the broker, and the integrity tag appended to
//! durable audit records. Consumers dedupe on `event_id`; the envelope is the
//! wire contract and must stay backward compatible within a schema version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod routing;

/// Current schema version for all events.
pub const SCHEMA_VERSION: u32 = 1;

/// Entity types referenced by events.
pub mod entity {
    pub const PROJECT: &str = "project";
    pub const RUNNER: &str = "runner";
    pub const SESSION: &str = "session";
    pub const BUDGET: &str = "budget";
    pub const DAEMON: &str = "daemon";
}

/// Envelope wrapped around every event published to the broker.
///
/// `event_id` is assigned by the producer and preserved across retries so
/// consumers can deduplicate at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID for idempotency and tracing.
    pub event_id: Uuid,
    /// Fully qualified event kind (e.g. "runner.started").
    pub kind: String,
    /// Server-side event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Schema version for compatibility checking.
    pub schema_version: u32,
    /// Entity type the event refers to.
    pub entity_type: String,
    /// Identifier of the entity within its type.
    pub entity_id: String,
    /// Who caused the event ("daemon", an operator credential name, ...).
    pub actor: String,
    /// Event payload.
    pub data: serde_json::Value,
    /// Correlation ID for distributed tracing.
    pub trace_id: Option<Uuid>,
}

impl EventEnvelope {
    pub fn new(
        kind: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind: kind.into(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            actor: "daemon".to_string(),
            data,
            trace_id: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Integrity tag for the durable audit row: SHA-256 over the fields that
    /// must never change after append.
    pub fn integrity_tag(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.kind.as_bytes());
        hasher.update(self.entity_type.as_bytes());
        hasher.update(self.entity_id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.data.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Alert severities carried in `system.alert.*` routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_event_id() {
        let env = EventEnvelope::new(
            "runner.started",
            entity::RUNNER,
            "r-1",
            serde_json::json!({"project": "p1"}),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, env.event_id);
        assert_eq!(back.kind, "runner.started");
        assert_eq!(back.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn integrity_tag_is_stable_for_same_content() {
        let env = EventEnvelope::new(
            "runner.failed",
            entity::RUNNER,
            "r-2",
            serde_json::json!({"exit_code": 1}),
        );
        assert_eq!(env.integrity_tag(), env.integrity_tag());
    }

    #[test]
    fn integrity_tag_changes_with_payload() {
        let a = EventEnvelope::new("runner.failed", entity::RUNNER, "r-3", serde_json::json!(1));
        let mut b = a.clone();
        b.data = serde_json::json!(2);
        assert_ne!(a.integrity_tag(), b.integrity_tag());
    }
}
