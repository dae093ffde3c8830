//! `PostgreSQL` transactional outbox.
//!
//! Table:
//!
//! ```sql
//! CREATE TABLE outbox_messages (
//!     id UUID PRIMARY KEY,
//!     aggregate_id TEXT NOT NULL,
//!     aggregate_type TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     processed BOOLEAN NOT NULL DEFAULT false,
//!     processed_at TIMESTAMPTZ,
//!     retry_count INT NOT NULL DEFAULT 0,
//!     error TEXT,
//!     available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX idx_outbox_pending
//!     ON outbox_messages (available_at, created_at) WHERE processed = false;
//! ```
//!
//! # Claiming
//!
//! [`OutboxStore::claim_batch`] is one statement: an `UPDATE` over the ids
//! selected `FOR UPDATE SKIP LOCKED`, pushing `available_at` forward by the
//! lease. Two publisher instances ticking at the same moment receive
//! disjoint batches, and a claimant that crashes mid-batch simply leaves
//! its messages to resurface when the lease runs out. The same
//! `available_at` column doubles as the retry backoff gate.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use taskflow_core::outbox::{NewOutboxMessage, OutboxError, OutboxMessage, OutboxStore};
use uuid::Uuid;

/// `PostgreSQL`-backed [`OutboxStore`].
pub struct PostgresOutboxStore {
    pool: PgPool,
}

const RETURNING_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, \
     processed, processed_at, retry_count, error, available_at, created_at";

impl PostgresOutboxStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a message inside the caller's transaction.
    ///
    /// This is the outbox pattern's load-bearing call: the message commits
    /// if and only if the caller's business write commits.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    pub async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        message: NewOutboxMessage,
    ) -> Result<OutboxMessage, OutboxError> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO outbox_messages (id, aggregate_id, aggregate_type, event_type, payload)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {RETURNING_COLUMNS}
            "
        ))
        .bind(Uuid::new_v4())
        .bind(&message.aggregate_id)
        .bind(&message.aggregate_type)
        .bind(&message.event_type)
        .bind(&message.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        Self::row_to_message(&row)
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, OutboxError> {
        Ok(OutboxMessage {
            id: row.get("id"),
            aggregate_id: row.get("aggregate_id"),
            aggregate_type: row.get("aggregate_type"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            processed: row.get("processed"),
            processed_at: row.get("processed_at"),
            retry_count: row.get("retry_count"),
            error: row.get("error"),
            available_at: row.get("available_at"),
            created_at: row.get("created_at"),
        })
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn enqueue(
        &self,
        message: NewOutboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxMessage, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                INSERT INTO outbox_messages (id, aggregate_id, aggregate_type, event_type, payload)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {RETURNING_COLUMNS}
                "
            ))
            .bind(Uuid::new_v4())
            .bind(&message.aggregate_id)
            .bind(&message.aggregate_type)
            .bind(&message.event_type)
            .bind(&message.payload)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            Self::row_to_message(&row)
        })
    }

    fn claim_batch(
        &self,
        limit: usize,
        max_retries: i32,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Batch limits are small
            let rows = sqlx::query(&format!(
                r"
                UPDATE outbox_messages
                SET available_at = $1
                WHERE id IN (
                    SELECT id FROM outbox_messages
                    WHERE processed = false
                      AND retry_count < $2
                      AND available_at <= $3
                    ORDER BY created_at ASC
                    LIMIT $4
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {RETURNING_COLUMNS}
                "
            ))
            .bind(now + lease)
            .bind(max_retries)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            let mut claimed: Vec<OutboxMessage> = rows
                .iter()
                .map(Self::row_to_message)
                .collect::<Result<_, _>>()?;
            // UPDATE … RETURNING row order is unspecified.
            claimed.sort_by_key(|m| m.created_at);
            Ok(claimed)
        })
    }

    fn mark_processed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET processed = true, processed_at = $2
                WHERE id = $1 AND processed = false
                ",
            )
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let error = error.to_string();

        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET retry_count = retry_count + 1, error = $2, available_at = $3
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(&error)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }

    fn exhausted_count(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM outbox_messages
                WHERE processed = false AND retry_count >= $1
                ",
            )
            .bind(max_retries)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            Ok(count)
        })
    }

    fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM outbox_messages
                WHERE processed = true AND processed_at < $1
                ",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            let deleted = result.rows_affected();
            if deleted > 0 {
                tracing::info!(deleted, "Outbox retention sweep removed processed messages");
            }
            Ok(deleted)
        })
    }
}

impl std::fmt::Debug for PostgresOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresOutboxStore").finish_non_exhaustive()
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

        assert_send::<PostgresOutboxStore>();
        assert_sync::<PostgresOutboxStore>();
    }
}
