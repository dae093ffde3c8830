//! Deduplicating inbox records and store trait.
//!
//! The inbox makes at-least-once broker delivery at-most-once in effect:
//! every consumed message is recorded under its globally unique
//! `message_id` before its handler runs, and completion is a conditional
//! update. A redelivery of an already-processed message is recognized and
//! the handler is not invoked again.
//!
//! The store trait carries the two operations the guarantee rests on:
//!
//! - [`InboxStore::insert_pending`] is an idempotent unique-key insert
//!   (`ON CONFLICT DO NOTHING` semantics): exactly one row per
//!   `message_id` ever exists, whichever delivery arrives first creates it.
//! - [`InboxStore::mark_processed`] is conditional on `processed = false`
//!   and reports whether this caller won; the loser of a concurrent race
//!   treats the message as a duplicate.
//!
//! The processing algorithm itself (check → insert → invoke → complete)
//! lives in `taskflow-runtime`'s `InboxProcessor`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from inbox operations.
#[derive(Error, Debug)]
pub enum InboxError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// No inbox row exists for the message id.
    #[error("Inbox message not found: {0}")]
    NotFound(String),

    /// The message was already processed (manual retry refused).
    #[error("Inbox message already processed: {0}")]
    AlreadyProcessed(String),

    /// The message's handler failed; carries the recorded error message.
    #[error("Handler failed for message {message_id}: {message}")]
    Handler {
        /// The failing message id.
        message_id: String,
        /// The recorded error.
        message: String,
    },
}

/// A consumed message recorded for deduplication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Row id.
    pub id: Uuid,
    /// Globally unique external correlation key (the dedup key).
    pub message_id: String,
    /// Dot-delimited event type.
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
    /// Transport the message arrived on, e.g. `"redpanda"`.
    pub source: String,
    /// Whether a handler completed successfully.
    pub processed: bool,
    /// When processing completed. Set iff `processed`.
    pub processed_at: Option<DateTime<Utc>>,
    /// Name of the handler that completed the message.
    pub processed_by: Option<String>,
    /// Failed handler attempts so far.
    pub retry_count: i32,
    /// Last handler error, if any.
    pub error: Option<String>,
    /// When the processed row becomes eligible for the expiry sweep.
    pub expires_at: DateTime<Utc>,
    /// First arrival time.
    pub created_at: DateTime<Utc>,
}

/// A message arriving for the first time.
#[derive(Clone, Debug)]
pub struct NewInboxMessage {
    /// Globally unique external correlation key.
    pub message_id: String,
    /// Dot-delimited event type.
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
    /// Transport name.
    pub source: String,
    /// TTL boundary for the expiry sweep.
    pub expires_at: DateTime<Utc>,
}

/// Durable store backing the inbox.
pub trait InboxStore: Send + Sync {
    /// Find a message by its dedup key.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Database`] on storage failure.
    fn find(
        &self,
        message_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<InboxMessage>, InboxError>> + Send + '_>>;

    /// Insert a pending row if none exists for this `message_id`
    /// (unique-key insert, conflict = no-op), returning the row that is
    /// now present — the freshly inserted one or the pre-existing one.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Database`] on storage failure.
    fn insert_pending(
        &self,
        message: NewInboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<InboxMessage, InboxError>> + Send + '_>>;

    /// Mark a message processed, conditional on `processed = false`.
    ///
    /// Returns `true` when this call performed the transition; `false`
    /// when a concurrent processor already had. This conditional update is
    /// the authoritative at-most-once-effect guard.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Database`] on storage failure.
    fn mark_processed(
        &self,
        message_id: &str,
        processed_by: &str,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, InboxError>> + Send + '_>>;

    /// Record a handler failure: increment `retry_count` and store the
    /// error. Returns the new retry count.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::NotFound`] when no row exists, or
    /// [`InboxError::Database`] on storage failure.
    fn record_failure(
        &self,
        message_id: &str,
        error: &str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, InboxError>> + Send + '_>>;

    /// Unprocessed messages, oldest first, up to `limit` — candidates for
    /// DLQ escalation.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Database`] on storage failure.
    fn stuck(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InboxMessage>, InboxError>> + Send + '_>>;

    /// Delete processed messages whose `expires_at` has passed. Returns
    /// the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Database`] on storage failure.
    fn delete_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, InboxError>> + Send + '_>>;
}
