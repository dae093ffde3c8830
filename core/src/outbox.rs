//! Transactional outbox records and store trait.
//!
//! The outbox solves the dual-write problem: a business transaction records
//! the event it wants published in the same transaction as its primary
//! write, and a background publisher drains the table to the broker
//! afterwards. The event row exists if and only if the business write
//! committed.
//!
//! The trait below describes the publisher's side: an atomic batch claim
//! and the per-message success/failure updates. The co-transactional
//! enqueue is necessarily storage-specific — `PostgresOutboxStore` exposes
//! `enqueue_in_tx(&mut Transaction, …)` for callers holding a transaction;
//! the trait-level [`OutboxStore::enqueue`] covers callers without one
//! (and the in-memory store).
//!
//! # Multi-instance safety
//!
//! [`OutboxStore::claim_batch`] must be a single atomic claim (conditional
//! update or `FOR UPDATE SKIP LOCKED`), never read-then-write: two
//! publisher instances claiming concurrently must receive disjoint
//! batches. The claim extends each message's `available_at` lease so a
//! crashed claimant's batch resurfaces after the lease expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from outbox store operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Message not found.
    #[error("Outbox message not found: {0}")]
    NotFound(Uuid),
}

/// An event recorded for asynchronous publication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Unique message id; becomes the broker envelope id.
    pub id: Uuid,
    /// Aggregate instance that produced the event.
    pub aggregate_id: String,
    /// Aggregate type.
    pub aggregate_type: String,
    /// Dot-delimited event type; the broker routing key.
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
    /// Whether the message reached the broker.
    pub processed: bool,
    /// When it reached the broker. Set iff `processed`.
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub retry_count: i32,
    /// Last publish error, if any.
    pub error: Option<String>,
    /// Claim lease / backoff gate: eligible for a tick only when
    /// `available_at <= now`.
    pub available_at: DateTime<Utc>,
    /// When the business transaction enqueued the message.
    pub created_at: DateTime<Utc>,
}

/// A message to enqueue.
#[derive(Clone, Debug)]
pub struct NewOutboxMessage {
    /// Aggregate instance that produced the event.
    pub aggregate_id: String,
    /// Aggregate type.
    pub aggregate_type: String,
    /// Dot-delimited event type.
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
}

impl NewOutboxMessage {
    /// Create a message for the given aggregate and event type.
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Durable store backing the outbox.
pub trait OutboxStore: Send + Sync {
    /// Enqueue a message on a connection of the store's own choosing.
    ///
    /// Callers holding a database transaction should prefer the
    /// implementation's transactional enqueue so the message commits with
    /// the business write.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn enqueue(
        &self,
        message: NewOutboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxMessage, OutboxError>> + Send + '_>>;

    /// Atomically claim up to `limit` unprocessed messages with
    /// `retry_count < max_retries` and `available_at <= now`, oldest first,
    /// extending each claimed message's lease by `lease`.
    ///
    /// Concurrent claimants receive disjoint batches.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn claim_batch(
        &self,
        limit: usize,
        max_retries: i32,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>>;

    /// Mark a message processed (conditional on `processed = false`).
    ///
    /// Returns `false` when the message was already processed by another
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn mark_processed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>>;

    /// Record a publish failure: increment `retry_count`, store `error`,
    /// and set `available_at = next_attempt_at` (backoff).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Number of unprocessed messages at or above the retry ceiling
    /// (exhausted; no longer claimed by ticks).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn exhausted_count(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + '_>>;

    /// Delete processed messages with `processed_at < cutoff` (retention
    /// sweep). Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_outbox_message_carries_fields() {
        let message = NewOutboxMessage::new(
            "t-1",
            "task",
            "task.created",
            serde_json::json!({"title": "x"}),
        );
        assert_eq!(message.aggregate_id, "t-1");
        assert_eq!(message.event_type, "task.created");
    }

    #[test]
    fn not_found_display_includes_id() {
        let id = Uuid::nil();
        let err = OutboxError::NotFound(id);
        assert!(format!("{err}").contains("00000000"));
    }
}
