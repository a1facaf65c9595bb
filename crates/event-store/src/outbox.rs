//! Outbox records written in the same atomic unit as the events they announce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, EventEnvelope, EventId, Version};

/// Unique identifier for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Not yet delivered; picked up by the next dispatcher scan.
    #[default]
    Pending,
    /// Acknowledged by the publisher.
    Dispatched,
    /// Rejected permanently or out of attempts; needs an operator.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "dispatched" => Some(OutboxStatus::Dispatched),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A not-yet-published message owned by exactly one committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message_id: MessageId,
    pub aggregate_id: AggregateId,
    /// The owning event.
    pub event_id: EventId,
    pub event_type: String,
    /// Sequence number of the owning event, for per-aggregate ordering.
    pub version: Version,
    /// The full event envelope as JSON.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    /// Number of failed delivery attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Builds the pending outbox entry announcing `event`.
    pub fn for_event(event: &EventEnvelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: MessageId::new(),
            aggregate_id: event.aggregate_id,
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            version: event.version,
            payload: serde_json::to_value(event)?,
            created_at: Utc::now(),
            dispatched_at: None,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
        })
    }

    /// Decodes the announced event.
    pub fn event(&self) -> Result<EventEnvelope, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Reads a metadata value of the announced event without decoding the whole envelope.
    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get("metadata").and_then(|m| m.get(key))
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> EventEnvelope {
        EventEnvelope::builder()
            .event_type("FundsDeposited")
            .aggregate_id(AggregateId::new())
            .aggregate_type("Account")
            .version(Version::new(3))
            .payload_raw(serde_json::json!({"amount": 100}))
            .metadata("saga_id", serde_json::json!("abc"))
            .build()
    }

    #[test]
    fn entry_for_event_is_pending_and_owned_by_event() {
        let event = event();
        let entry = OutboxEntry::for_event(&event).unwrap();

        assert_eq!(entry.event_id, event.event_id);
        assert_eq!(entry.aggregate_id, event.aggregate_id);
        assert_eq!(entry.version, Version::new(3));
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert!(entry.dispatched_at.is_none());
        assert_eq!(entry.event().unwrap(), event);
    }

    #[test]
    fn metadata_lookup_reads_envelope_metadata() {
        let entry = OutboxEntry::for_event(&event()).unwrap();
        assert_eq!(entry.metadata("saga_id"), Some(&serde_json::json!("abc")));
        assert_eq!(entry.metadata("tenant_id"), None);
    }

    #[test]
    fn status_parse_matches_as_str() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Dispatched,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("unknown"), None);
    }
}
