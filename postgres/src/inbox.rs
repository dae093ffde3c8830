//! `PostgreSQL` deduplicating inbox.
//!
//! Table:
//!
//! ```sql
//! CREATE TABLE inbox_messages (
//!     id UUID PRIMARY KEY,
//!     message_id TEXT NOT NULL UNIQUE,
//!     event_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     source TEXT NOT NULL,
//!     processed BOOLEAN NOT NULL DEFAULT false,
//!     processed_at TIMESTAMPTZ,
//!     processed_by TEXT,
//!     retry_count INT NOT NULL DEFAULT 0,
//!     error TEXT,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX idx_inbox_stuck ON inbox_messages (created_at) WHERE processed = false;
//! ```
//!
//! The unique constraint on `message_id` plus the conditional completion
//! update in [`InboxStore::mark_processed`] are the two statements the
//! at-most-once-effect guarantee rests on.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use taskflow_core::inbox::{InboxError, InboxMessage, InboxStore, NewInboxMessage};
use uuid::Uuid;

/// `PostgreSQL`-backed [`InboxStore`].
pub struct PostgresInboxStore {
    pool: PgPool,
}

const COLUMNS: &str = "id, message_id, event_type, payload, source, processed, processed_at, \
     processed_by, retry_count, error, expires_at, created_at";

impl PostgresInboxStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> InboxMessage {
        InboxMessage {
            id: row.get("id"),
            message_id: row.get("message_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            source: row.get("source"),
            processed: row.get("processed"),
            processed_at: row.get("processed_at"),
            processed_by: row.get("processed_by"),
            retry_count: row.get("retry_count"),
            error: row.get("error"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
        }
    }
}

impl InboxStore for PostgresInboxStore {
    fn find(
        &self,
        message_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<InboxMessage>, InboxError>> + Send + '_>> {
        let message_id = message_id.to_string();

        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM inbox_messages WHERE message_id = $1"
            ))
            .bind(&message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

            Ok(row.as_ref().map(Self::row_to_message))
        })
    }

    fn insert_pending(
        &self,
        message: NewInboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<InboxMessage, InboxError>> + Send + '_>> {
        Box::pin(async move {
            // Unique-key insert: whichever concurrent delivery runs first
            // creates the row, everyone else reads it back.
            sqlx::query(
                r"
                INSERT INTO inbox_messages (id, message_id, event_type, payload, source, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (message_id) DO NOTHING
                ",
            )
            .bind(Uuid::new_v4())
            .bind(&message.message_id)
            .bind(&message.event_type)
            .bind(&message.payload)
            .bind(&message.source)
            .bind(message.expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM inbox_messages WHERE message_id = $1"
            ))
            .bind(&message.message_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

            Ok(Self::row_to_message(&row))
        })
    }

    fn mark_processed(
        &self,
        message_id: &str,
        processed_by: &str,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, InboxError>> + Send + '_>> {
        let message_id = message_id.to_string();
        let processed_by = processed_by.to_string();

        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE inbox_messages
                SET processed = true, processed_at = $2, processed_by = $3
                WHERE message_id = $1 AND processed = false
                ",
            )
            .bind(&message_id)
            .bind(at)
            .bind(&processed_by)
            .execute(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn record_failure(
        &self,
        message_id: &str,
        error: &str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, InboxError>> + Send + '_>> {
        let message_id = message_id.to_string();
        let error = error.to_string();

        Box::pin(async move {
            let row = sqlx::query(
                r"
                UPDATE inbox_messages
                SET retry_count = retry_count + 1, error = $2
                WHERE message_id = $1
                RETURNING retry_count
                ",
            )
            .bind(&message_id)
            .bind(&error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

            row.map(|r| r.get("retry_count"))
                .ok_or(InboxError::NotFound(message_id))
        })
    }

    fn stuck(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InboxMessage>, InboxError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Sweep limits are small
            let rows = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM inbox_messages
                WHERE processed = false
                ORDER BY created_at ASC
                LIMIT $1
                "
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_message).collect())
        })
    }

    fn delete_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, InboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM inbox_messages
                WHERE processed = true AND expires_at <= $1
                ",
            )
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

            let deleted = result.rows_affected();
            if deleted > 0 {
                tracing::info!(deleted, "Inbox expiry sweep removed processed messages");
            }
            Ok(deleted)
        })
    }
}

impl std::fmt::Debug for PostgresInboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresInboxStore").finish_non_exhaustive()
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

        assert_send::<PostgresInboxStore>();
        assert_sync::<PostgresInboxStore>();
    }
}
