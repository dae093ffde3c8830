//! Broker consumer loop: broker → inbox → in-process event bus.
//!
//! One loop per process subscribes to the event topics, runs every
//! received message through the inbox's idempotency boundary, and fans the
//! surviving events out over the in-process bus to the registered
//! listeners (audit, notifications, realtime, webhook dispatcher).
//!
//! The broker transport commits offsets as it hands messages to this loop
//! (at-least-once); handler failures are therefore NOT retried by
//! requeueing the broker message — they accumulate on the inbox row's
//! `retry_count` and flow to the DLQ sweep once the ceiling is reached.
//! That is the poison-message policy: a permanently failing message ends
//! up parked for an operator instead of looping through the broker.

use crate::inbox::{InboxProcessor, metadata_from_payload};
use crate::retry::{RetryPolicy, retry_with_backoff};
use futures::StreamExt;
use std::sync::Arc;
use taskflow_core::broker::{Broker, BrokerError, BrokerMessage};
use taskflow_core::bus::EventBus;
use taskflow_core::environment::Clock;
use taskflow_core::event::DomainEvent;
use taskflow_core::inbox::InboxError;
use tokio::task::JoinHandle;

/// Handler name recorded on inbox rows completed by this loop.
const HANDLER_NAME: &str = "event-bus";

/// The broker → inbox → bus consumer.
pub struct BrokerConsumer {
    broker: Arc<dyn Broker>,
    inbox: Arc<InboxProcessor>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    topics: Vec<String>,
    source: String,
}

impl BrokerConsumer {
    /// Create a consumer over the given topics.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        inbox: Arc<InboxProcessor>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            broker,
            inbox,
            bus,
            clock,
            topics,
            source: "redpanda".to_string(),
        }
    }

    /// Override the transport name recorded on inbox rows.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Subscribe and consume until the stream ends.
    ///
    /// The subscription bootstrap is retried with backoff (a broker that
    /// is still starting should delay the consumer, not kill it). Message
    /// failures are handled per message and never end the loop.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the subscription cannot be established
    /// within the retry budget.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

        let mut stream = retry_with_backoff(
            RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(std::time::Duration::from_millis(500))
                .build(),
            || self.broker.subscribe(&topics),
        )
        .await?;

        tracing::info!(topics = ?self.topics, "Broker consumer started");

        while let Some(received) = stream.next().await {
            match received {
                Ok(message) => self.handle_message(message).await,
                Err(err) => {
                    tracing::error!(error = %err, "Broker stream error");
                    metrics::counter!("taskflow.consumer.stream_errors").increment(1);
                },
            }
        }

        tracing::warn!("Broker stream ended");
        Ok(())
    }

    async fn handle_message(&self, message: BrokerMessage) {
        // Producers that omit the envelope id weaken dedup to best-effort:
        // the synthesized key is unique per arrival.
        let message_id = message.id.map_or_else(
            || format!("{}-{}", message.event_type, self.clock.now().timestamp_millis()),
            |id| id.to_string(),
        );

        let event = DomainEvent::new(
            message.event_type.clone(),
            message.payload.clone(),
            metadata_from_payload(&message.payload),
            self.clock.now(),
        );

        let bus = Arc::clone(&self.bus);
        let result = self
            .inbox
            .process_message(
                &message_id,
                &message.event_type,
                message.payload,
                &self.source,
                HANDLER_NAME,
                move || {
                    let event = event;
                    async move { bus.publish(&event).await }
                },
            )
            .await;

        match result {
            Ok(true) => {},
            Ok(false) => {
                tracing::debug!(message_id, "Duplicate delivery ignored");
            },
            Err(InboxError::Handler { .. }) => {
                // Recorded on the inbox row; the DLQ sweep takes it from
                // here once the retry ceiling is crossed.
            },
            Err(err) => {
                tracing::error!(message_id, error = %err, "Inbox processing failed");
            },
        }
    }

    /// Spawn the consumer with automatic resubscription.
    ///
    /// If the stream ends or the subscription is lost, the loop waits
    /// briefly and subscribes again.
    pub fn spawn(consumer: &Arc<Self>) -> JoinHandle<()> {
        let consumer = Arc::clone(consumer);
        tokio::spawn(async move {
            loop {
                if let Err(err) = consumer.run().await {
                    tracing::error!(error = %err, "Broker consumer failed, resubscribing");
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    // The consumer's end-to-end behavior (dedup, fan-out, failure
    // accounting) is covered in tests/pipeline.rs against the in-memory
    // broker and stores.
}
