//! Domain event envelope and metadata.
//!
//! Every component in the delivery pipeline — outbox, broker, inbox, bus,
//! webhooks, event store — moves the same envelope: a dot-delimited event
//! type (`"task.created"`, `"project.member.added"`), an opaque JSON payload
//! owned by the producing module, and delivery metadata (tenant, user,
//! causation/correlation ids).
//!
//! Payloads are `serde_json::Value` rather than typed structs on purpose:
//! the delivery subsystem must carry events whose schemas it does not know,
//! including events produced by newer code than the consumer. Typed decoding
//! happens at the edges, inside handlers that own the schema.
//!
//! # Replay tagging
//!
//! Events re-emitted by the event store's replay operation carry a
//! [`ReplayInfo`] tag. Handlers use [`DomainEvent::is_replay`] to suppress
//! non-idempotent side effects (emails, webhooks) during reprocessing; the
//! tag is mandatory on replayed events, the suppression policy belongs to
//! each handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery metadata attached to every domain event.
///
/// All fields are optional opaque identifiers supplied by the upstream
/// application layer. The delivery core never interprets them beyond
/// tenant-scoping webhook fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The user who triggered the event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// The tenant the event belongs to. Required for webhook fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Id of the message/event that directly caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Id correlating all events of one logical operation (e.g. a saga).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventMetadata {
    /// Metadata carrying only a tenant id.
    #[must_use]
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }
}

/// Tag attached to events re-emitted by a replay run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayInfo {
    /// Id of the stored event this emission was replayed from.
    pub original_event_id: Uuid,

    /// When the replay run emitted this event.
    pub replayed_at: DateTime<Utc>,
}

/// A domain event as it flows through the in-process pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique id of this emission.
    pub id: Uuid,

    /// Dot-delimited event type, e.g. `"task.created"`.
    pub event_type: String,

    /// Opaque JSON payload owned by the producing module.
    pub payload: serde_json::Value,

    /// Delivery metadata.
    #[serde(default)]
    pub metadata: EventMetadata,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Present iff this emission is a replay of a stored event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayInfo>,
}

impl DomainEvent {
    /// Create a new first-run (non-replay) event.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        metadata: EventMetadata,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            metadata,
            occurred_at,
            replay: None,
        }
    }

    /// Whether this emission is a replay of a stored event.
    ///
    /// Handlers with non-idempotent side effects (emails, webhooks) should
    /// check this before acting.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        self.replay.is_some()
    }

    /// Tag this event as a replay of `original_event_id`.
    #[must_use]
    pub fn into_replay(mut self, original_event_id: Uuid, replayed_at: DateTime<Utc>) -> Self {
        self.replay = Some(ReplayInfo {
            original_event_id,
            replayed_at,
        });
        self
    }
}

impl std::fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DomainEvent {{ id: {}, type: {} }}", self.id, self.event_type)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn sample_event() -> DomainEvent {
        DomainEvent::new(
            "task.created",
            serde_json::json!({"task_id": "t-1", "title": "write spec"}),
            EventMetadata::for_tenant("tenant-1"),
            Utc::now(),
        )
    }

    #[test]
    fn new_event_is_not_replay() {
        let event = sample_event();
        assert!(!event.is_replay());
        assert_eq!(event.event_type, "task.created");
        assert_eq!(event.metadata.tenant_id.as_deref(), Some("tenant-1"));
    }

    #[test]
    fn replay_tag_carries_original_id() {
        let event = sample_event();
        let original = Uuid::new_v4();
        let replayed = event.into_replay(original, Utc::now());

        assert!(replayed.is_replay());
        let info = replayed.replay.expect("replay info should be present");
        assert_eq!(info.original_event_id, original);
    }

    #[test]
    fn serde_roundtrip_preserves_replay_tag() {
        let event = sample_event().into_replay(Uuid::new_v4(), Utc::now());

        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, event.id);
        assert_eq!(back.replay, event.replay);
    }

    #[test]
    fn replay_tag_absent_from_json_for_first_run_events() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("replay").is_none());
    }
}
