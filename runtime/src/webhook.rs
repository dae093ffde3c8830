//! Tenant webhook fan-out with HMAC-signed deliveries.
//!
//! The dispatcher listens on the in-process bus (match-all pattern) and,
//! for every tenant-scoped event, posts the payload to each active
//! registration whose pattern set matches the event type. Deliveries of
//! one event run concurrently — each request has its own future and its
//! own timeout, so one slow endpoint cannot serialize the rest — and every
//! attempt is recorded, success or failure.
//!
//! Webhook failures never propagate into the emitting flow: the bus
//! handler logs and returns `Ok`. Retrying is an explicit operator action
//! ([`WebhookDispatcher::retry_delivery`]), never automatic.
//!
//! # Request format
//!
//! HTTP POST, JSON body = the exact event payload, with headers:
//!
//! | header | value |
//! |---|---|
//! | `content-type` | `application/json` |
//! | `x-taskflow-event` | event type |
//! | `x-taskflow-signature` | HMAC-SHA256 hex over the exact body bytes |
//! | `x-taskflow-delivery` | delivery record id |
//! | `user-agent` | `taskflow-webhook/1.0` |

use futures::future::join_all;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskflow_core::bus::{EventHandler, HandlerError};
use taskflow_core::environment::Clock;
use taskflow_core::event::DomainEvent;
use taskflow_core::webhook::{
    NewWebhook, Webhook, WebhookDelivery, WebhookError, WebhookStore,
};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// User-agent sent with every delivery.
pub const USER_AGENT: &str = "taskflow-webhook/1.0";

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct WebhookDispatcherConfig {
    /// Hard per-delivery timeout.
    pub timeout: Duration,
    /// Stored response bodies are truncated to this many bytes.
    pub response_limit: usize,
}

impl Default for WebhookDispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            response_limit: 1024,
        }
    }
}

/// Webhook fan-out service and bus handler.
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    config: WebhookDispatcherConfig,
}

impl WebhookDispatcher {
    /// Create a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] if the HTTP client cannot be
    /// built (TLS backend initialization).
    pub fn new(
        store: Arc<dyn WebhookStore>,
        clock: Arc<dyn Clock>,
        config: WebhookDispatcherConfig,
    ) -> Result<Self, WebhookError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WebhookError::Database(format!("http client: {e}")))?;

        Ok(Self {
            store,
            http,
            clock,
            config,
        })
    }

    /// HMAC-SHA256 signature (hex) over `body` with `secret`.
    ///
    /// Receivers recompute this over the exact bytes they received and
    /// compare.
    ///
    /// # Panics
    ///
    /// Never panics in practice: HMAC accepts keys of any length.
    #[must_use]
    #[allow(clippy::expect_used)] // HMAC-SHA256 accepts keys of any length
    pub fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Register a webhook, generating a secret when none was supplied
    /// (32 random bytes, hex-encoded).
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    pub async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook, WebhookError> {
        let secret = new.secret.unwrap_or_else(generate_secret);
        let webhook = Webhook {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            name: new.name,
            url: new.url,
            events: new.events,
            secret,
            is_active: true,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            created_at: self.clock.now(),
        };
        self.store.create(webhook).await
    }

    /// Fan one event out to every matching webhook of its tenant.
    ///
    /// Returns the number of deliveries attempted. Events without a
    /// tenant id are skipped (webhooks are tenant-scoped).
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] when the registration lookup
    /// fails; individual delivery failures are recorded, not returned.
    pub async fn dispatch(&self, event: &DomainEvent) -> Result<usize, WebhookError> {
        let Some(tenant_id) = event.metadata.tenant_id.as_deref() else {
            return Ok(0);
        };

        let webhooks = self.store.active_for_tenant(tenant_id).await?;
        let matching: Vec<Webhook> = webhooks
            .into_iter()
            .filter(|w| w.subscribes_to(&event.event_type))
            .collect();

        if matching.is_empty() {
            return Ok(0);
        }

        tracing::info!(
            tenant_id,
            event_type = %event.event_type,
            webhooks = matching.len(),
            "Triggering webhooks"
        );

        let deliveries = matching
            .iter()
            .map(|webhook| self.deliver(webhook, &event.event_type, &event.payload, 0));
        let results = join_all(deliveries).await;

        Ok(results.len())
    }

    /// Perform one delivery attempt and record it.
    ///
    /// Never fails: transport errors, timeouts, and non-2xx responses all
    /// become recorded failure rows.
    async fn deliver(
        &self,
        webhook: &Webhook,
        event_type: &str,
        payload: &serde_json::Value,
        retry_count: i32,
    ) -> WebhookDelivery {
        let delivery_id = Uuid::new_v4();
        let body = serde_json::to_vec(payload).unwrap_or_default();
        let signature = Self::sign(&webhook.secret, &body);
        let started = Instant::now();

        let response = self
            .http
            .post(&webhook.url)
            .header("content-type", "application/json")
            .header("x-taskflow-event", event_type)
            .header("x-taskflow-signature", signature)
            .header("x-taskflow-delivery", delivery_id.to_string())
            .header("user-agent", USER_AGENT)
            .body(body)
            .send()
            .await;

        #[allow(clippy::cast_possible_wrap)] // Durations fit comfortably in i64
        let duration_ms = started.elapsed().as_millis() as i64;
        let now = self.clock.now();

        let mut delivery = WebhookDelivery {
            id: delivery_id,
            webhook_id: webhook.id,
            tenant_id: webhook.tenant_id.clone(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            status_code: None,
            response: None,
            error: None,
            success: false,
            duration_ms,
            retry_count,
            created_at: now,
        };

        match response {
            Ok(resp) => {
                let status = resp.status();
                #[allow(clippy::cast_possible_wrap)] // HTTP status codes are small
                {
                    delivery.status_code = Some(i32::from(status.as_u16()));
                }
                let text = resp.text().await.unwrap_or_default();
                delivery.response = Some(truncate(&text, self.config.response_limit));
                delivery.success = status.is_success();

                if !status.is_success() {
                    delivery.error = Some(format!("unexpected status {status}"));
                }
            },
            Err(err) => {
                delivery.error = Some(err.to_string());
            },
        }

        self.record(webhook, &delivery).await;
        delivery
    }

    /// Persist the delivery row and the registration bookkeeping.
    async fn record(&self, webhook: &Webhook, delivery: &WebhookDelivery) {
        if let Err(err) = self.store.insert_delivery(delivery.clone()).await {
            tracing::error!(webhook_id = %webhook.id, error = %err, "Failed to record delivery");
        }

        let bookkeeping = if delivery.success {
            tracing::info!(
                webhook_id = %webhook.id,
                duration_ms = delivery.duration_ms,
                "Webhook delivered"
            );
            metrics::counter!("taskflow.webhook.delivered").increment(1);
            self.store.record_success(webhook.id, delivery.created_at).await
        } else {
            tracing::error!(
                webhook_id = %webhook.id,
                status = ?delivery.status_code,
                error = ?delivery.error,
                duration_ms = delivery.duration_ms,
                "Webhook delivery failed"
            );
            metrics::counter!("taskflow.webhook.failed").increment(1);
            self.store.record_failure(webhook.id, delivery.created_at).await
        };

        if let Err(err) = bookkeeping {
            tracing::error!(webhook_id = %webhook.id, error = %err, "Failed to update webhook state");
        }

        #[allow(clippy::cast_precision_loss)] // Histogram precision is cosmetic
        metrics::histogram!("taskflow.webhook.delivery_duration_seconds")
            .record(delivery.duration_ms as f64 / 1000.0);
    }

    /// Re-execute a recorded delivery (operator action).
    ///
    /// Increments the original record's `retry_count` and performs a fresh
    /// attempt with the same event type and payload.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::DeliveryNotFound`]: unknown delivery for this
    ///   tenant
    /// - [`WebhookError::NotFound`]: the webhook registration is gone
    pub async fn retry_delivery(
        &self,
        delivery_id: Uuid,
        tenant_id: &str,
    ) -> Result<WebhookDelivery, WebhookError> {
        let original = self.store.find_delivery(delivery_id, tenant_id).await?;
        let webhook = self.store.find(original.webhook_id).await?;

        self.store.increment_delivery_retry(delivery_id).await?;

        Ok(self
            .deliver(
                &webhook,
                &original.event_type,
                &original.payload,
                original.retry_count + 1,
            )
            .await)
    }

    /// Delivery history for one webhook.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Database`] on storage failure.
    pub async fn deliveries(
        &self,
        webhook_id: Uuid,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        self.store.deliveries(webhook_id, tenant_id, limit).await
    }
}

impl EventHandler for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook-dispatcher"
    }

    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            // Replays must not re-notify external systems.
            if event.is_replay() {
                return Ok(());
            }

            // Delivery failures are visible in the delivery history only;
            // they never fail the emitting flow.
            if let Err(err) = self.dispatch(&event).await {
                tracing::error!(
                    event_type = %event.event_type,
                    error = %err,
                    "Webhook dispatch failed"
                );
            }
            Ok(())
        })
    }
}

/// 32 random bytes, hex-encoded.
fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
