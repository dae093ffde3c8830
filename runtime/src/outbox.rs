//! Outbox publisher and retention sweep.
//!
//! Every tick (default 5 s) the publisher atomically claims a batch of
//! eligible outbox messages — unprocessed, below the retry ceiling, past
//! their backoff gate — and pushes each to the broker exactly once per
//! tick. Success marks the row processed; failure records the error and
//! pushes the row's `available_at` out by the policy backoff. Messages
//! that reach the retry ceiling simply stop being claimed; they are not
//! escalated to the DLQ, only surfaced through the
//! `taskflow.outbox.exhausted` gauge.
//!
//! A broker outage therefore degrades to "every tick fails and reschedules
//! its batch" — the loop never crashes and never loses a message.

use crate::retry::RetryPolicy;
use crate::scheduler::spawn_periodic;
use std::sync::Arc;
use std::time::Duration;
use taskflow_core::broker::{Broker, BrokerMessage};
use taskflow_core::environment::Clock;
use taskflow_core::outbox::{OutboxError, OutboxStore};
use tokio::task::JoinHandle;

/// Outbox publisher tuning.
#[derive(Clone, Debug)]
pub struct OutboxPublisherConfig {
    /// Messages claimed per tick.
    pub batch_size: usize,
    /// Retry ceiling; messages at or above it are no longer claimed.
    pub max_retries: i32,
    /// Claim lease: how long a claimed message stays invisible to other
    /// publisher instances.
    pub claim_lease: chrono::Duration,
    /// Backoff applied to failed publishes via `available_at`.
    pub backoff: RetryPolicy,
    /// Processed rows older than this are removed by the retention sweep.
    pub retention: chrono::Duration,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 5,
            claim_lease: chrono::Duration::seconds(60),
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_secs(5))
                .max_delay(Duration::from_secs(300))
                .multiplier(2.0)
                .build(),
            retention: chrono::Duration::days(30),
        }
    }
}

/// Outcome of one publisher tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutboxTickReport {
    /// Messages claimed this tick.
    pub claimed: usize,
    /// Messages successfully published.
    pub published: usize,
    /// Messages whose publish failed (rescheduled with backoff).
    pub failed: usize,
}

/// Background publisher draining the outbox to the broker.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    config: OutboxPublisherConfig,
}

impl OutboxPublisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        config: OutboxPublisherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            config,
        }
    }

    /// Run one publisher tick: claim a batch and attempt each message once.
    ///
    /// Publish failures are recorded per message and do not fail the tick;
    /// only store-level errors propagate.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] when the store itself fails.
    pub async fn tick(&self) -> Result<OutboxTickReport, OutboxError> {
        let now = self.clock.now();
        let batch = self
            .store
            .claim_batch(
                self.config.batch_size,
                self.config.max_retries,
                now,
                self.config.claim_lease,
            )
            .await?;

        let mut report = OutboxTickReport {
            claimed: batch.len(),
            ..OutboxTickReport::default()
        };

        if batch.is_empty() {
            return Ok(report);
        }

        tracing::debug!(claimed = batch.len(), "Processing outbox batch");

        for message in batch {
            let envelope = BrokerMessage {
                id: Some(message.id),
                event_type: message.event_type.clone(),
                payload: message.payload.clone(),
            };

            match self.broker.publish(&message.event_type, &envelope).await {
                Ok(()) => {
                    self.store.mark_processed(message.id, self.clock.now()).await?;
                    report.published += 1;
                    tracing::debug!(
                        outbox_id = %message.id,
                        event_type = %message.event_type,
                        "Outbox message published"
                    );
                    metrics::counter!(
                        "taskflow.outbox.published",
                        "event_type" => message.event_type.clone()
                    )
                    .increment(1);
                },
                Err(err) => {
                    #[allow(clippy::cast_sign_loss)] // retry_count is never negative
                    let backoff = self
                        .config
                        .backoff
                        .delay_for_attempt(message.retry_count as usize);
                    let next_attempt_at = self.clock.now()
                        + chrono::Duration::from_std(backoff)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));

                    self.store
                        .record_failure(message.id, &err.to_string(), next_attempt_at)
                        .await?;
                    report.failed += 1;
                    tracing::error!(
                        outbox_id = %message.id,
                        event_type = %message.event_type,
                        retry_count = message.retry_count + 1,
                        error = %err,
                        "Outbox publish failed"
                    );
                    metrics::counter!("taskflow.outbox.publish_failures").increment(1);
                },
            }
        }

        #[allow(clippy::cast_precision_loss)] // Gauge precision is cosmetic
        {
            let exhausted = self.store.exhausted_count(self.config.max_retries).await?;
            metrics::gauge!("taskflow.outbox.exhausted").set(exhausted as f64);
        }

        Ok(report)
    }

    /// Delete processed messages past the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] when the store fails.
    pub async fn retention_sweep(&self) -> Result<u64, OutboxError> {
        let cutoff = self.clock.now() - self.config.retention;
        self.store.delete_processed_before(cutoff).await
    }

    /// Spawn the periodic publisher tick (default cadence: every 5 s).
    pub fn spawn(publisher: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let publisher = Arc::clone(publisher);
        spawn_periodic("outbox-publisher", every, move || {
            let publisher = Arc::clone(&publisher);
            async move { publisher.tick().await.map(|_| ()) }
        })
    }

    /// Spawn the periodic retention sweep (default cadence: daily).
    pub fn spawn_retention(publisher: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let publisher = Arc::clone(publisher);
        spawn_periodic("outbox-retention", every, move || {
            let publisher = Arc::clone(&publisher);
            async move { publisher.retention_sweep().await.map(|_| ()) }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use taskflow_core::outbox::NewOutboxMessage;

    // End-to-end publisher behavior (success, retry, exhaustion) is covered
    // in tests/pipeline.rs with the in-memory broker and stores; here we
    // pin the contractual config defaults.

    #[test]
    fn default_config_matches_contract() {
        let config = OutboxPublisherConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retention, chrono::Duration::days(30));
    }

    #[test]
    fn new_message_shape() {
        let message =
            NewOutboxMessage::new("t-1", "task", "task.created", serde_json::json!({}));
        assert_eq!(message.aggregate_type, "task");
    }
}
