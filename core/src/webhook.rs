//! Webhook registrations, delivery records, and store trait.
//!
//! Tenants register URLs with a set of event-type patterns and a shared
//! secret. The dispatcher (in `taskflow-runtime`) fans matching domain
//! events out to them and records every attempt here as an append-only
//! audit trail. The registration rows carry rolling health bookkeeping:
//! `failure_count` resets to zero on any success.

use crate::pattern::EventPattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from webhook store operations.
#[derive(Error, Debug)]
pub enum WebhookError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Webhook registration not found.
    #[error("Webhook not found: {0}")]
    NotFound(Uuid),

    /// Delivery record not found.
    #[error("Webhook delivery not found: {0}")]
    DeliveryNotFound(Uuid),
}

/// A tenant's webhook registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Webhook {
    /// Registration id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Human-readable name.
    pub name: String,
    /// Destination URL.
    pub url: String,
    /// Event-type patterns this webhook subscribes to.
    pub events: Vec<EventPattern>,
    /// HMAC signing secret (hex string).
    pub secret: String,
    /// Inactive webhooks are skipped by the dispatcher.
    pub is_active: bool,
    /// Consecutive failures since the last success.
    pub failure_count: i32,
    /// Most recent successful delivery.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Most recent failed delivery.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the registration was created.
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    /// Whether any subscribed pattern matches `event_type`.
    #[must_use]
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|pattern| pattern.matches(event_type))
    }
}

/// A registration to create.
#[derive(Clone, Debug)]
pub struct NewWebhook {
    /// Owning tenant.
    pub tenant_id: String,
    /// Human-readable name.
    pub name: String,
    /// Destination URL.
    pub url: String,
    /// Subscribed event-type patterns.
    pub events: Vec<EventPattern>,
    /// Signing secret; `None` asks the service to generate one.
    pub secret: Option<String>,
}

/// Mutable registration fields for updates.
#[derive(Clone, Debug, Default)]
pub struct WebhookUpdate {
    /// New URL, if changing.
    pub url: Option<String>,
    /// New pattern set, if changing.
    pub events: Option<Vec<EventPattern>>,
    /// New active flag, if changing.
    pub is_active: Option<bool>,
}

/// One delivery attempt, successful or not. Append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Delivery id, also sent as the `x-taskflow-delivery` header.
    pub id: Uuid,
    /// The webhook attempted.
    pub webhook_id: Uuid,
    /// Owning tenant (denormalized for tenant-scoped listing).
    pub tenant_id: String,
    /// Event type delivered.
    pub event_type: String,
    /// The JSON body that was posted.
    pub payload: serde_json::Value,
    /// HTTP status code, when a response arrived.
    pub status_code: Option<i32>,
    /// Truncated response body, when a response arrived.
    pub response: Option<String>,
    /// Transport or timeout error, when no response arrived.
    pub error: Option<String>,
    /// Whether the attempt counted as delivered (2xx).
    pub success: bool,
    /// Wall-clock duration of the attempt.
    pub duration_ms: i64,
    /// Manual retries performed on this delivery record.
    pub retry_count: i32,
    /// When the attempt was made.
    pub created_at: DateTime<Utc>,
}

/// Durable store for webhook registrations and delivery history.
pub trait WebhookStore: Send + Sync {
    /// Create a registration.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn create(
        &self,
        webhook: Webhook,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>>;

    /// Find a registration by id.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::NotFound`]: no such registration
    /// - [`WebhookError::Database`]: storage failure
    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>>;

    /// All registrations of a tenant, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn for_tenant(
        &self,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>, WebhookError>> + Send + '_>>;

    /// Active registrations of a tenant (dispatcher working set).
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn active_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>, WebhookError>> + Send + '_>>;

    /// Apply a partial update to a tenant's registration.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::NotFound`]: no such registration for this tenant
    /// - [`WebhookError::Database`]: storage failure
    fn update(
        &self,
        id: Uuid,
        tenant_id: &str,
        update: WebhookUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>>;

    /// Delete a tenant's registration.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn delete(
        &self,
        id: Uuid,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>>;

    /// Record a successful delivery on the registration: reset
    /// `failure_count` to 0 and set `last_success_at`.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn record_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>>;

    /// Record a failed delivery on the registration: increment
    /// `failure_count` and set `last_failure_at`.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn record_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>>;

    /// Append a delivery record.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn insert_delivery(
        &self,
        delivery: WebhookDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>>;

    /// Find a tenant's delivery record by id.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::DeliveryNotFound`]: no such delivery
    /// - [`WebhookError::Database`]: storage failure
    fn find_delivery(
        &self,
        id: Uuid,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<WebhookDelivery, WebhookError>> + Send + '_>>;

    /// Delivery history for one webhook, newest first, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn deliveries(
        &self,
        webhook_id: Uuid,
        tenant_id: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookDelivery>, WebhookError>> + Send + '_>>;

    /// Increment a delivery record's manual `retry_count`.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    fn increment_delivery_retry(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn webhook(patterns: &[&str]) -> Webhook {
        Webhook {
            id: Uuid::new_v4(),
            tenant_id: "tenant-1".to_string(),
            name: "ci".to_string(),
            url: "https://example.com/hook".to_string(),
            events: patterns.iter().map(|p| p.parse().unwrap()).collect(),
            secret: "s3cret".to_string(),
            is_active: true,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn subscribes_to_matches_any_pattern() {
        let hook = webhook(&["task.*", "project.created"]);
        assert!(hook.subscribes_to("task.created"));
        assert!(hook.subscribes_to("project.created"));
        assert!(!hook.subscribes_to("user.created"));
    }

    #[test]
    fn bare_star_subscription_sees_all() {
        let hook = webhook(&["*"]);
        assert!(hook.subscribes_to("task.status.changed"));
        assert!(hook.subscribes_to("user.logged_in"));
    }
}
