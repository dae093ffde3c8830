//! Message-broker transport abstraction.
//!
//! The broker is an external at-least-once transport: the outbox publisher
//! pushes messages to it, the consumer loop pulls them back into the inbox.
//! Topics are routed by event-type string; the message body is the JSON
//! envelope `{id, event_type, payload}`.
//!
//! # Delivery semantics
//!
//! - **At-least-once**: implementations must not drop a message before the
//!   subscriber has received it; duplicates are expected and are resolved
//!   by the inbox, not the transport.
//! - **Ack after processing**: implementations commit/ack a message only
//!   after it has been handed to the subscriber's stream. Unrecoverable
//!   handler failures are not requeued broker-side — they ride the inbox
//!   retry counter into the DLQ sweep instead of looping as poison
//!   messages.
//! - **Outages degrade, never crash**: publish failures surface as
//!   [`BrokerError`] values for the publisher loop to retry on its next
//!   tick.
//!
//! # Implementations
//!
//! - `RedpandaBroker` (in `taskflow-redpanda`): Kafka-compatible production
//!   transport
//! - `InMemoryBroker` (in `taskflow-testing`): deterministic transport with
//!   failure injection

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message.
    #[error("Publish failed for routing key '{routing_key}': {reason}")]
    PublishFailed {
        /// The routing key that failed.
        routing_key: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to decode a received message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// The JSON wire envelope carried by the broker.
///
/// `id` is the deduplication key the inbox uses; producers that omit it get
/// one synthesized at consume time (from the event type and arrival time),
/// which weakens dedup to best-effort for that producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Unique message id, the inbox dedup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Dot-delimited event type; also the routing key.
    pub event_type: String,

    /// Opaque JSON payload.
    pub payload: serde_json::Value,
}

impl BrokerMessage {
    /// Create an envelope with a fresh message id.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Stream of messages from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BrokerMessage, BrokerError>> + Send>>;

/// Broker transport trait.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one broker handle is shared
/// process-wide (`Arc<dyn Broker>`) between the outbox publisher, the
/// consumer loop, and any direct emitters, and publish/subscribe must be
/// safe to call concurrently.
///
/// # Dyn Compatibility
///
/// Methods return explicit `Pin<Box<dyn Future>>` so the trait can be used
/// as a trait object.
pub trait Broker: Send + Sync {
    /// Publish one message under `routing_key` (the event type).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the transport rejects the
    /// message; the caller (outbox publisher) retries on its next tick.
    fn publish(
        &self,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of messages.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the subscription
    /// cannot be established.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BrokerError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn envelope_json_shape() {
        let message = BrokerMessage {
            id: Some(Uuid::nil()),
            event_type: "task.created".to_string(),
            payload: serde_json::json!({"task_id": "t-1"}),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "00000000-0000-0000-0000-000000000000",
                "event_type": "task.created",
                "payload": {"task_id": "t-1"},
            })
        );
    }

    #[test]
    fn envelope_without_id_still_decodes() {
        let message: BrokerMessage =
            serde_json::from_str(r#"{"event_type":"task.created","payload":{}}"#).unwrap();
        assert_eq!(message.id, None);
        assert_eq!(message.event_type, "task.created");
    }

    #[test]
    fn new_assigns_an_id() {
        let message = BrokerMessage::new("task.created", serde_json::json!({}));
        assert!(message.id.is_some());
    }
}
