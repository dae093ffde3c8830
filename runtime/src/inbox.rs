//! Idempotent inbox processing.
//!
//! [`InboxProcessor::process_message`] is the at-most-once-effect boundary
//! between at-least-once transports and in-process handlers:
//!
//! 1. look up the message by its unique `message_id`
//! 2. already processed → return `Ok(false)` WITHOUT invoking the handler
//! 3. otherwise record the pending row (unique-key insert)
//! 4. invoke the handler exactly once
//! 5. success → conditional completion update, `Ok(true)`
//! 6. failure → increment `retry_count`, record the error, and propagate
//!    the handler error so the transport layer can apply its own policy
//!
//! Between steps 1 and 5 a concurrent delivery of the same `message_id`
//! cannot double-complete: the unique constraint gives both deliveries the
//! same row and the conditional update lets exactly one of them win.
//! (Both may invoke the handler under a true race — that is the
//! at-least-once contract; the completion update is the at-most-once
//! EFFECT guard.)

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use taskflow_core::bus::{EventBus, HandlerError};
use taskflow_core::environment::Clock;
use taskflow_core::event::{DomainEvent, EventMetadata};
use taskflow_core::inbox::{InboxError, InboxStore, NewInboxMessage};
use tokio::task::JoinHandle;

/// Idempotent processor over an [`InboxStore`].
pub struct InboxProcessor {
    store: Arc<dyn InboxStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl InboxProcessor {
    /// Default retention of processed rows (7 days).
    pub const DEFAULT_TTL_DAYS: i64 = 7;

    /// Create a processor with the default 7-day TTL.
    #[must_use]
    pub fn new(store: Arc<dyn InboxStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: chrono::Duration::days(Self::DEFAULT_TTL_DAYS),
        }
    }

    /// Override the processed-row TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Process one message idempotently.
    ///
    /// Returns `Ok(true)` when the handler ran and the message was
    /// completed by this call; `Ok(false)` when the message was already
    /// processed (the handler was NOT invoked) or a concurrent processor
    /// completed it first.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Handler`] when the handler fails; the failure
    /// is recorded on the row (`retry_count`, `error`) before propagating.
    /// Storage failures surface as [`InboxError::Database`].
    pub async fn process_message<F, Fut>(
        &self,
        message_id: &str,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
        handler_name: &str,
        handler: F,
    ) -> Result<bool, InboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        if let Some(existing) = self.store.find(message_id).await? {
            if existing.processed {
                tracing::debug!(message_id, "Message already processed, skipping");
                metrics::counter!("taskflow.inbox.duplicates").increment(1);
                return Ok(false);
            }
        }

        self.store
            .insert_pending(NewInboxMessage {
                message_id: message_id.to_string(),
                event_type: event_type.to_string(),
                payload,
                source: source.to_string(),
                expires_at: self.clock.now() + self.ttl,
            })
            .await?;

        match handler().await {
            Ok(()) => {
                let completed = self
                    .store
                    .mark_processed(message_id, handler_name, self.clock.now())
                    .await?;
                if completed {
                    tracing::debug!(message_id, event_type, "Message processed");
                    metrics::counter!(
                        "taskflow.inbox.processed",
                        "event_type" => event_type.to_string()
                    )
                    .increment(1);
                } else {
                    // A concurrent delivery finished first; this one is a
                    // duplicate in effect.
                    metrics::counter!("taskflow.inbox.duplicates").increment(1);
                }
                Ok(completed)
            },
            Err(err) => {
                let retry_count = self.store.record_failure(message_id, &err.message).await?;
                tracing::error!(
                    message_id,
                    event_type,
                    retry_count,
                    error = %err.message,
                    "Message handler failed"
                );
                metrics::counter!("taskflow.inbox.handler_failures").increment(1);
                Err(InboxError::Handler {
                    message_id: message_id.to_string(),
                    message: err.message,
                })
            },
        }
    }

    /// Re-dispatch a stored message's payload through the event bus.
    ///
    /// Used by the DLQ's manual retry. On a successful dispatch the row is
    /// marked processed so the escalation sweep stops seeing it.
    ///
    /// # Errors
    ///
    /// - [`InboxError::NotFound`]: no row for `message_id`
    /// - [`InboxError::AlreadyProcessed`]: the message does not need a
    ///   retry
    /// - [`InboxError::Handler`]: a handler failed during re-dispatch
    pub async fn retry_message(&self, message_id: &str, bus: &EventBus) -> Result<(), InboxError> {
        let message = self
            .store
            .find(message_id)
            .await?
            .ok_or_else(|| InboxError::NotFound(message_id.to_string()))?;

        if message.processed {
            return Err(InboxError::AlreadyProcessed(message_id.to_string()));
        }

        let event = DomainEvent::new(
            message.event_type.clone(),
            message.payload.clone(),
            metadata_from_payload(&message.payload),
            self.clock.now(),
        );

        bus.publish(&event).await.map_err(|err| InboxError::Handler {
            message_id: message_id.to_string(),
            message: err.message,
        })?;

        self.store
            .mark_processed(message_id, "manual-retry", self.clock.now())
            .await?;
        tracing::info!(message_id, "Message retried successfully");
        Ok(())
    }

    /// Delete processed rows past their TTL. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Database`] on storage failure.
    pub async fn cleanup_expired(&self) -> Result<u64, InboxError> {
        self.store.delete_expired(self.clock.now()).await
    }

    /// Spawn the periodic expiry sweep (default cadence: daily).
    pub fn spawn_cleanup(processor: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let processor = Arc::clone(processor);
        crate::scheduler::spawn_periodic("inbox-expiry", every, move || {
            let processor = Arc::clone(&processor);
            async move { processor.cleanup_expired().await.map(|_| ()) }
        })
    }
}

/// Lift the well-known identity fields out of an opaque payload.
///
/// Broker envelopes carry no metadata block; producers put `tenant_id`
/// and `user_id` inside the payload, and the webhook dispatcher needs the
/// tenant to scope fan-out.
#[must_use]
pub fn metadata_from_payload(payload: &serde_json::Value) -> EventMetadata {
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
    };

    EventMetadata {
        user_id: field("user_id"),
        tenant_id: field("tenant_id"),
        causation_id: field("causation_id"),
        correlation_id: field("correlation_id"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn metadata_lifted_from_payload() {
        let payload = serde_json::json!({
            "tenant_id": "tenant-1",
            "user_id": "user-9",
            "title": "irrelevant",
        });

        let metadata = metadata_from_payload(&payload);
        assert_eq!(metadata.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(metadata.user_id.as_deref(), Some("user-9"));
        assert_eq!(metadata.correlation_id, None);
    }

    #[test]
    fn metadata_from_non_object_payload_is_empty() {
        let metadata = metadata_from_payload(&serde_json::json!("just a string"));
        assert_eq!(metadata, EventMetadata::default());
    }
}
