//! `PostgreSQL` event store.
//!
//! Table:
//!
//! ```sql
//! CREATE TABLE events (
//!     id UUID PRIMARY KEY,
//!     aggregate_id TEXT NOT NULL,
//!     aggregate_type TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     version BIGINT NOT NULL,
//!     event_data JSONB NOT NULL,
//!     metadata JSONB,
//!     occurred_at TIMESTAMPTZ NOT NULL,
//!     UNIQUE (aggregate_id, aggregate_type, version)
//! );
//! ```
//!
//! # Version assignment
//!
//! `append_event` computes the next version inside the insert itself
//! (`COALESCE(MAX(version), 0) + 1` over the aggregate). Two concurrent
//! appenders may compute the same version; the unique constraint rejects
//! one with error 23505 and the insert is retried with a freshly computed
//! version. The retry budget is small and bounded — exhausting it means
//! pathological contention on a single aggregate, which is surfaced as
//! [`EventStoreError::VersionConflict`].

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use taskflow_core::event::EventMetadata;
use taskflow_core::event_store::{
    EventStore, EventStoreError, EventTypeCount, NewEvent, StoredEvent, Version,
};
use uuid::Uuid;

/// Attempts made against the version unique constraint before giving up.
const APPEND_ATTEMPTS: u32 = 5;

/// `PostgreSQL`-backed [`EventStore`].
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
        let metadata_json: Option<serde_json::Value> = row.get("metadata");
        let metadata = metadata_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?
            .unwrap_or_default();

        Ok(StoredEvent {
            id: row.get("id"),
            aggregate_id: row.get("aggregate_id"),
            aggregate_type: row.get("aggregate_type"),
            event_type: row.get("event_type"),
            version: Version::new(row.get("version")),
            event_data: row.get("event_data"),
            metadata,
            occurred_at: row.get("occurred_at"),
        })
    }

    fn is_unique_violation(error: &sqlx::Error) -> bool {
        matches!(
            error,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
        )
    }

    async fn try_append(&self, event: &NewEvent, id: Uuid) -> Result<StoredEvent, sqlx::Error> {
        let metadata = serde_json::to_value(&event.metadata).unwrap_or(serde_json::Value::Null);

        let row = sqlx::query(
            r"
            INSERT INTO events (
                id, aggregate_id, aggregate_type, event_type, version,
                event_data, metadata, occurred_at
            ) VALUES (
                $1, $2, $3, $4,
                (SELECT COALESCE(MAX(version), 0) + 1
                   FROM events
                  WHERE aggregate_id = $2 AND aggregate_type = $3),
                $5, $6, $7
            )
            RETURNING id, aggregate_id, aggregate_type, event_type, version,
                      event_data, metadata, occurred_at
            ",
        )
        .bind(id)
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(&event.event_data)
        .bind(metadata)
        .bind(event.occurred_at)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_event(&row).map_err(|e| sqlx::Error::Decode(e.to_string().into()))
    }
}

impl EventStore for PostgresEventStore {
    fn append_event(
        &self,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            for attempt in 1..=APPEND_ATTEMPTS {
                match self.try_append(&event, Uuid::new_v4()).await {
                    Ok(stored) => {
                        tracing::debug!(
                            aggregate_id = %stored.aggregate_id,
                            aggregate_type = %stored.aggregate_type,
                            event_type = %stored.event_type,
                            version = %stored.version,
                            "Event appended"
                        );
                        metrics::counter!(
                            "taskflow.event_store.appended",
                            "event_type" => stored.event_type.clone()
                        )
                        .increment(1);
                        return Ok(stored);
                    },
                    Err(err) if Self::is_unique_violation(&err) => {
                        tracing::debug!(
                            aggregate_id = %event.aggregate_id,
                            attempt,
                            "Version conflict, retrying append"
                        );
                    },
                    Err(err) => return Err(EventStoreError::Database(err.to_string())),
                }
            }

            Err(EventStoreError::VersionConflict {
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                attempts: APPEND_ATTEMPTS,
            })
        })
    }

    fn aggregate_events(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        let aggregate_id = aggregate_id.to_string();
        let aggregate_type = aggregate_type.to_string();

        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, aggregate_id, aggregate_type, event_type, version,
                       event_data, metadata, occurred_at
                FROM events
                WHERE aggregate_id = $1 AND aggregate_type = $2
                ORDER BY version ASC
                ",
            )
            .bind(&aggregate_id)
            .bind(&aggregate_type)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

            rows.iter().map(Self::row_to_event).collect()
        })
    }

    fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        event_types: Option<&[String]>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        let event_types = event_types.map(<[String]>::to_vec);

        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, aggregate_id, aggregate_type, event_type, version,
                       event_data, metadata, occurred_at
                FROM events
                WHERE occurred_at BETWEEN $1 AND $2
                  AND ($3::text[] IS NULL OR event_type = ANY($3))
                ORDER BY occurred_at ASC
                ",
            )
            .bind(start)
            .bind(end)
            .bind(event_types)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

            rows.iter().map(Self::row_to_event).collect()
        })
    }

    fn type_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventTypeCount>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT event_type, DATE(occurred_at) AS day, COUNT(*) AS count
                FROM events
                WHERE occurred_at >= $1
                GROUP BY event_type, DATE(occurred_at)
                ORDER BY day ASC, event_type ASC
                ",
            )
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

            Ok(rows
                .iter()
                .map(|row| EventTypeCount {
                    event_type: row.get("event_type"),
                    day: row.get("day"),
                    count: row.get("count"),
                })
                .collect())
        })
    }
}

impl std::fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEventStore").finish_non_exhaustive()
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

        assert_send::<PostgresEventStore>();
        assert_sync::<PostgresEventStore>();
    }

    #[test]
    fn metadata_defaults_when_column_null() {
        // row_to_event maps a NULL metadata column to the default metadata;
        // covered indirectly here by the serde contract.
        let metadata: EventMetadata =
            serde_json::from_value(serde_json::json!({})).unwrap_or_default();
        assert_eq!(metadata, EventMetadata::default());
    }
}
