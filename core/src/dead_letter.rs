//! Dead-letter queue records and store trait.
//!
//! The DLQ is the terminal store for messages that exhausted their retry
//! budget. Nothing leaves it automatically: a dead letter is closed only by
//! a successful manual retry or an explicit manual resolution.
//!
//! Insertion dedupes on the open row: escalating the same
//! `original_message_id` again while an unresolved entry exists updates
//! that entry's `last_failed_at`/`attempt_count` instead of growing the
//! table without bound.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from dead-letter store operations.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Dead letter not found.
    #[error("Dead letter not found: {0}")]
    NotFound(Uuid),
}

/// A message that exhausted its retry budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Row id.
    pub id: Uuid,
    /// The inbox `message_id` this entry was escalated from.
    pub original_message_id: String,
    /// Dot-delimited event type.
    pub event_type: String,
    /// Opaque JSON payload, preserved for replay.
    pub payload: serde_json::Value,
    /// Transport the message arrived on.
    pub source: String,
    /// The accumulated error that exhausted the budget.
    pub failure_reason: String,
    /// Handler attempts made before escalation.
    pub attempt_count: i32,
    /// When this entry was first escalated.
    pub first_failed_at: DateTime<Utc>,
    /// Most recent escalation touch.
    pub last_failed_at: DateTime<Utc>,
    /// Terminal state: closed by manual retry-success or resolution.
    pub resolved: bool,
    /// When the entry was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator who resolved it.
    pub resolved_by: Option<String>,
    /// Free-form resolution notes.
    pub resolution_notes: Option<String>,
}

/// An escalation into the DLQ.
#[derive(Clone, Debug)]
pub struct NewDeadLetter {
    /// The inbox `message_id` being escalated.
    pub original_message_id: String,
    /// Dot-delimited event type.
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
    /// Transport name.
    pub source: String,
    /// The accumulated error.
    pub failure_reason: String,
    /// Handler attempts made.
    pub attempt_count: i32,
}

/// Aggregated DLQ statistics for the operator surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// Total entries, resolved and not.
    pub total: i64,
    /// Resolved entries.
    pub resolved: i64,
    /// Unresolved entries.
    pub unresolved: i64,
    /// Unresolved counts grouped by event type.
    pub by_event_type: Vec<(String, i64)>,
}

/// Durable store backing the dead-letter queue.
pub trait DeadLetterStore: Send + Sync {
    /// Record an escalation. If an unresolved entry for
    /// `original_message_id` already exists, update its `last_failed_at`
    /// and `attempt_count` instead of inserting a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Database`] on storage failure.
    fn insert(
        &self,
        dead_letter: NewDeadLetter,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>>;

    /// Find an entry by id.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`]: no such entry
    /// - [`DeadLetterError::Database`]: storage failure
    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>>;

    /// Unresolved entries, most recently failed first, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Database`] on storage failure.
    fn unresolved(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>>;

    /// Unresolved entries of one event type, most recently failed first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Database`] on storage failure.
    fn unresolved_by_event_type(
        &self,
        event_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>>;

    /// Close an entry: set `resolved`, `resolved_at`, `resolved_by`,
    /// `resolution_notes`.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`]: no such entry
    /// - [`DeadLetterError::Database`]: storage failure
    fn mark_resolved(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// Aggregated statistics.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Database`] on storage failure.
    fn stats(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetterStats, DeadLetterError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_are_serializable() {
        let stats = DeadLetterStats {
            total: 10,
            resolved: 4,
            unresolved: 6,
            by_event_type: vec![("task.created".to_string(), 6)],
        };
        let json = serde_json::to_value(&stats).unwrap_or_default();
        assert_eq!(json["unresolved"], 6);
    }

    #[test]
    fn not_found_display() {
        let err = DeadLetterError::NotFound(Uuid::nil());
        assert!(format!("{err}").contains("not found"));
    }
}
