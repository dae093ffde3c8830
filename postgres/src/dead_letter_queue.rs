//! `PostgreSQL` dead-letter queue.
//!
//! Table:
//!
//! ```sql
//! CREATE TABLE dead_letters (
//!     id UUID PRIMARY KEY,
//!     original_message_id TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     source TEXT NOT NULL,
//!     failure_reason TEXT NOT NULL,
//!     attempt_count INT NOT NULL,
//!     first_failed_at TIMESTAMPTZ NOT NULL,
//!     last_failed_at TIMESTAMPTZ NOT NULL,
//!     resolved BOOLEAN NOT NULL DEFAULT false,
//!     resolved_at TIMESTAMPTZ,
//!     resolved_by TEXT,
//!     resolution_notes TEXT
//! );
//! CREATE UNIQUE INDEX idx_dead_letters_open
//!     ON dead_letters (original_message_id) WHERE resolved = false;
//! ```
//!
//! The partial unique index carries the dedup rule: at most one OPEN entry
//! per original message. Escalating the same message again lands on
//! `ON CONFLICT … DO UPDATE`, touching `last_failed_at`/`attempt_count`
//! instead of inserting a second row. Resolved entries are history and may
//! accumulate.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use taskflow_core::dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterStats, DeadLetterStore, NewDeadLetter,
};
use uuid::Uuid;

/// `PostgreSQL`-backed [`DeadLetterStore`].
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

const COLUMNS: &str = "id, original_message_id, event_type, payload, source, failure_reason, \
     attempt_count, first_failed_at, last_failed_at, resolved, resolved_at, resolved_by, \
     resolution_notes";

impl PostgresDeadLetterStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_dead_letter(row: &sqlx::postgres::PgRow) -> DeadLetter {
        DeadLetter {
            id: row.get("id"),
            original_message_id: row.get("original_message_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            source: row.get("source"),
            failure_reason: row.get("failure_reason"),
            attempt_count: row.get("attempt_count"),
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            resolved: row.get("resolved"),
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        }
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn insert(
        &self,
        dead_letter: NewDeadLetter,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                INSERT INTO dead_letters (
                    id, original_message_id, event_type, payload, source,
                    failure_reason, attempt_count, first_failed_at, last_failed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                ON CONFLICT (original_message_id) WHERE resolved = false
                DO UPDATE SET
                    last_failed_at = EXCLUDED.last_failed_at,
                    attempt_count = EXCLUDED.attempt_count,
                    failure_reason = EXCLUDED.failure_reason
                RETURNING {COLUMNS}
                "
            ))
            .bind(Uuid::new_v4())
            .bind(&dead_letter.original_message_id)
            .bind(&dead_letter.event_type)
            .bind(&dead_letter.payload)
            .bind(&dead_letter.source)
            .bind(&dead_letter.failure_reason)
            .bind(dead_letter.attempt_count)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Database(e.to_string()))?;

            let entry = Self::row_to_dead_letter(&row);

            tracing::error!(
                dlq_id = %entry.id,
                message_id = %entry.original_message_id,
                event_type = %entry.event_type,
                attempts = entry.attempt_count,
                "Message moved to dead letter queue"
            );
            metrics::counter!(
                "taskflow.dlq.added",
                "event_type" => entry.event_type.clone()
            )
            .increment(1);

            Ok(entry)
        })
    }

    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM dead_letters WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DeadLetterError::Database(e.to_string()))?;

            row.as_ref()
                .map(Self::row_to_dead_letter)
                .ok_or(DeadLetterError::NotFound(id))
        })
    }

    fn unresolved(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Listing limits are small
            let rows = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM dead_letters
                WHERE resolved = false
                ORDER BY last_failed_at DESC
                LIMIT $1
                "
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Database(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_dead_letter).collect())
        })
    }

    fn unresolved_by_event_type(
        &self,
        event_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>> {
        let event_type = event_type.to_string();

        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM dead_letters
                WHERE resolved = false AND event_type = $1
                ORDER BY last_failed_at DESC
                "
            ))
            .bind(&event_type)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Database(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_dead_letter).collect())
        })
    }

    fn mark_resolved(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let resolved_by = resolved_by.to_string();
        let notes = notes.to_string();

        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE dead_letters
                SET resolved = true, resolved_at = $2, resolved_by = $3, resolution_notes = $4
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(at)
            .bind(&resolved_by)
            .bind(&notes)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Database(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(DeadLetterError::NotFound(id));
            }

            tracing::info!(dlq_id = %id, resolved_by, "Dead letter resolved");
            metrics::counter!("taskflow.dlq.resolved").increment(1);
            Ok(())
        })
    }

    fn stats(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetterStats, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let (total, resolved): (i64, i64) = sqlx::query_as(
                r"
                SELECT COUNT(*), COUNT(*) FILTER (WHERE resolved = true)
                FROM dead_letters
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Database(e.to_string()))?;

            let rows = sqlx::query(
                r"
                SELECT event_type, COUNT(*) AS count
                FROM dead_letters
                WHERE resolved = false
                GROUP BY event_type
                ORDER BY count DESC, event_type ASC
                ",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Database(e.to_string()))?;

            Ok(DeadLetterStats {
                total,
                resolved,
                unresolved: total - resolved,
                by_event_type: rows
                    .iter()
                    .map(|row| (row.get("event_type"), row.get("count")))
                    .collect(),
            })
        })
    }
}

impl std::fmt::Debug for PostgresDeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDeadLetterStore").finish_non_exhaustive()
    }
}

// Exercised against a real database in tests/integration_tests.rs.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PostgresDeadLetterStore>();
        assert_sync::<PostgresDeadLetterStore>();
    }
}
