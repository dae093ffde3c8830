//! `PostgreSQL` webhook registrations and delivery audit trail.
//!
//! Tables:
//!
//! ```sql
//! CREATE TABLE webhooks (
//!     id UUID PRIMARY KEY,
//!     tenant_id TEXT NOT NULL,
//!     name TEXT NOT NULL,
//!     url TEXT NOT NULL,
//!     events JSONB NOT NULL DEFAULT '[]',
//!     secret TEXT NOT NULL,
//!     is_active BOOLEAN NOT NULL DEFAULT true,
//!     failure_count INT NOT NULL DEFAULT 0,
//!     last_success_at TIMESTAMPTZ,
//!     last_failure_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX idx_webhooks_tenant ON webhooks (tenant_id);
//!
//! CREATE TABLE webhook_deliveries (
//!     id UUID PRIMARY KEY,
//!     webhook_id UUID NOT NULL,
//!     tenant_id TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     status_code INT,
//!     response TEXT,
//!     error TEXT,
//!     success BOOLEAN NOT NULL,
//!     duration_ms BIGINT NOT NULL,
//!     retry_count INT NOT NULL DEFAULT 0,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX idx_webhook_deliveries_webhook
//!     ON webhook_deliveries (webhook_id, created_at DESC);
//! ```
//!
//! `events` stores the subscription patterns as a JSON array of pattern
//! strings; `webhook_id` is a soft reference (no foreign key — delivery
//! history outlives deleted registrations).

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use taskflow_core::pattern::EventPattern;
use taskflow_core::webhook::{
    Webhook, WebhookDelivery, WebhookError, WebhookStore, WebhookUpdate,
};
use uuid::Uuid;

/// `PostgreSQL`-backed [`WebhookStore`].
pub struct PostgresWebhookStore {
    pool: PgPool,
}

const WEBHOOK_COLUMNS: &str = "id, tenant_id, name, url, events, secret, is_active, \
     failure_count, last_success_at, last_failure_at, created_at";

const DELIVERY_COLUMNS: &str = "id, webhook_id, tenant_id, event_type, payload, status_code, \
     response, error, success, duration_ms, retry_count, created_at";

impl PostgresWebhookStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn patterns_json(events: &[EventPattern]) -> serde_json::Value {
        serde_json::Value::Array(
            events
                .iter()
                .map(|p| serde_json::Value::String(p.as_str().to_string()))
                .collect(),
        )
    }

    fn row_to_webhook(row: &sqlx::postgres::PgRow) -> Result<Webhook, WebhookError> {
        let events_json: serde_json::Value = row.get("events");
        let events: Vec<EventPattern> = serde_json::from_value(events_json)
            .map_err(|e| WebhookError::Database(format!("invalid events column: {e}")))?;

        Ok(Webhook {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            name: row.get("name"),
            url: row.get("url"),
            events,
            secret: row.get("secret"),
            is_active: row.get("is_active"),
            failure_count: row.get("failure_count"),
            last_success_at: row.get("last_success_at"),
            last_failure_at: row.get("last_failure_at"),
            created_at: row.get("created_at"),
        })
    }

    fn row_to_delivery(row: &sqlx::postgres::PgRow) -> WebhookDelivery {
        WebhookDelivery {
            id: row.get("id"),
            webhook_id: row.get("webhook_id"),
            tenant_id: row.get("tenant_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            status_code: row.get("status_code"),
            response: row.get("response"),
            error: row.get("error"),
            success: row.get("success"),
            duration_ms: row.get("duration_ms"),
            retry_count: row.get("retry_count"),
            created_at: row.get("created_at"),
        }
    }
}

impl WebhookStore for PostgresWebhookStore {
    fn create(
        &self,
        webhook: Webhook,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                INSERT INTO webhooks (
                    id, tenant_id, name, url, events, secret, is_active,
                    failure_count, last_success_at, last_failure_at, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING {WEBHOOK_COLUMNS}
                "
            ))
            .bind(webhook.id)
            .bind(&webhook.tenant_id)
            .bind(&webhook.name)
            .bind(&webhook.url)
            .bind(Self::patterns_json(&webhook.events))
            .bind(&webhook.secret)
            .bind(webhook.is_active)
            .bind(webhook.failure_count)
            .bind(webhook.last_success_at)
            .bind(webhook.last_failure_at)
            .bind(webhook.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;

            Self::row_to_webhook(&row)
        })
    }

    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| WebhookError::Database(e.to_string()))?;

            row.as_ref()
                .map(Self::row_to_webhook)
                .transpose()?
                .ok_or(WebhookError::NotFound(id))
        })
    }

    fn for_tenant(
        &self,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>, WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {WEBHOOK_COLUMNS}
                FROM webhooks
                WHERE tenant_id = $1
                ORDER BY created_at DESC
                "
            ))
            .bind(&tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;

            rows.iter().map(Self::row_to_webhook).collect()
        })
    }

    fn active_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>, WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {WEBHOOK_COLUMNS}
                FROM webhooks
                WHERE tenant_id = $1 AND is_active = true
                ORDER BY created_at DESC
                "
            ))
            .bind(&tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;

            rows.iter().map(Self::row_to_webhook).collect()
        })
    }

    fn update(
        &self,
        id: Uuid,
        tenant_id: &str,
        update: WebhookUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            let events_json = update.events.as_deref().map(Self::patterns_json);

            let row = sqlx::query(&format!(
                r"
                UPDATE webhooks
                SET url = COALESCE($3, url),
                    events = COALESCE($4, events),
                    is_active = COALESCE($5, is_active)
                WHERE id = $1 AND tenant_id = $2
                RETURNING {WEBHOOK_COLUMNS}
                "
            ))
            .bind(id)
            .bind(&tenant_id)
            .bind(&update.url)
            .bind(events_json)
            .bind(update.is_active)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;

            row.as_ref()
                .map(Self::row_to_webhook)
                .transpose()?
                .ok_or(WebhookError::NotFound(id))
        })
    }

    fn delete(
        &self,
        id: Uuid,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            sqlx::query("DELETE FROM webhooks WHERE id = $1 AND tenant_id = $2")
                .bind(id)
                .bind(&tenant_id)
                .execute(&self.pool)
                .await
                .map_err(|e| WebhookError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn record_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE webhooks
                SET failure_count = 0, last_success_at = $2
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn record_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE webhooks
                SET failure_count = failure_count + 1, last_failure_at = $2
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn insert_delivery(
        &self,
        delivery: WebhookDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO webhook_deliveries (
                    id, webhook_id, tenant_id, event_type, payload, status_code,
                    response, error, success, duration_ms, retry_count, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ",
            )
            .bind(delivery.id)
            .bind(delivery.webhook_id)
            .bind(&delivery.tenant_id)
            .bind(&delivery.event_type)
            .bind(&delivery.payload)
            .bind(delivery.status_code)
            .bind(&delivery.response)
            .bind(&delivery.error)
            .bind(delivery.success)
            .bind(delivery.duration_ms)
            .bind(delivery.retry_count)
            .bind(delivery.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn find_delivery(
        &self,
        id: Uuid,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<WebhookDelivery, WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1 AND tenant_id = $2"
            ))
            .bind(id)
            .bind(&tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;

            row.as_ref()
                .map(Self::row_to_delivery)
                .ok_or(WebhookError::DeliveryNotFound(id))
        })
    }

    fn deliveries(
        &self,
        webhook_id: Uuid,
        tenant_id: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookDelivery>, WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Listing limits are small
            let rows = sqlx::query(&format!(
                r"
                SELECT {DELIVERY_COLUMNS}
                FROM webhook_deliveries
                WHERE webhook_id = $1 AND tenant_id = $2
                ORDER BY created_at DESC
                LIMIT $3
                "
            ))
            .bind(webhook_id)
            .bind(&tenant_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_delivery).collect())
        })
    }

    fn increment_delivery_retry(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE webhook_deliveries SET retry_count = retry_count + 1 WHERE id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(WebhookError::DeliveryNotFound(id));
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for PostgresWebhookStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresWebhookStore").finish_non_exhaustive()
    }
}
