//! Webhook dispatcher tests against a local mock HTTP server: signature
//! headers, delivery recording, failure bookkeeping, and manual retry.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code uses unwrap/expect

use chrono::Utc;
use std::sync::Arc;
use taskflow_core::bus::EventHandler;
use taskflow_core::environment::SystemClock;
use taskflow_core::event::{DomainEvent, EventMetadata};
use taskflow_core::webhook::{NewWebhook, Webhook, WebhookStore};
use taskflow_runtime::webhook::{USER_AGENT, WebhookDispatcher, WebhookDispatcherConfig};
use taskflow_testing::stores::InMemoryWebhookStore;
use uuid::Uuid;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn dispatcher(store: &Arc<InMemoryWebhookStore>) -> WebhookDispatcher {
    WebhookDispatcher::new(
        Arc::clone(store) as Arc<dyn WebhookStore>,
        Arc::new(SystemClock),
        WebhookDispatcherConfig::default(),
    )
    .unwrap()
}

async fn register(
    dispatcher: &WebhookDispatcher,
    url: &str,
    patterns: &[&str],
    secret: Option<&str>,
) -> Webhook {
    dispatcher
        .create_webhook(NewWebhook {
            tenant_id: "tenant-1".to_string(),
            name: "ci-hook".to_string(),
            url: url.to_string(),
            events: patterns.iter().map(|p| p.parse().unwrap()).collect(),
            secret: secret.map(ToString::to_string),
        })
        .await
        .unwrap()
}

fn task_event(event_type: &str) -> DomainEvent {
    DomainEvent::new(
        event_type,
        serde_json::json!({"task_id": "t-1", "title": "ship"}),
        EventMetadata::for_tenant("tenant-1"),
        Utc::now(),
    )
}

#[tokio::test]
async fn delivery_carries_valid_signature_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists("x-taskflow-signature"))
        .and(header_exists("x-taskflow-delivery"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);
    let webhook = register(
        &dispatcher,
        &format!("{}/hook", server.uri()),
        &["task.*"],
        Some("whsec_test"),
    )
    .await;

    let event = task_event("task.created");
    let attempted = dispatcher.dispatch(&event).await.unwrap();
    assert_eq!(attempted, 1);

    // Verify the signature over the exact received body.
    let requests: Vec<Request> = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let signature = request.headers.get("x-taskflow-signature").unwrap().to_str().unwrap();
    let expected = WebhookDispatcher::sign("whsec_test", &request.body);
    assert_eq!(signature, expected);

    assert_eq!(
        request.headers.get("x-taskflow-event").unwrap().to_str().unwrap(),
        "task.created"
    );
    assert_eq!(
        request.headers.get("user-agent").unwrap().to_str().unwrap(),
        USER_AGENT
    );

    // Body is the raw payload, not a wrapper envelope.
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body, event.payload);

    // Delivery recorded, registration bookkeeping updated.
    let deliveries = dispatcher.deliveries(webhook.id, "tenant-1", 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].success);
    assert_eq!(deliveries[0].status_code, Some(200));
    assert_eq!(deliveries[0].response.as_deref(), Some("ok"));

    let updated = store.find(webhook.id).await.unwrap();
    assert_eq!(updated.failure_count, 0);
    assert!(updated.last_success_at.is_some());
}

#[tokio::test]
async fn non_success_status_records_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("downstream broken"))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);
    let webhook = register(&dispatcher, &server.uri(), &["task.*"], Some("s")).await;

    dispatcher.dispatch(&task_event("task.created")).await.unwrap();
    dispatcher.dispatch(&task_event("task.updated")).await.unwrap();

    let deliveries = dispatcher.deliveries(webhook.id, "tenant-1", 10).await.unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| !d.success));
    assert!(deliveries.iter().all(|d| d.status_code == Some(500)));

    let updated = store.find(webhook.id).await.unwrap();
    assert_eq!(updated.failure_count, 2, "failures accumulate");
    assert!(updated.last_failure_at.is_some());
}

#[tokio::test]
async fn success_resets_failure_count() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);
    let webhook = register(&dispatcher, &server.uri(), &["task.*"], Some("s")).await;

    dispatcher.dispatch(&task_event("task.created")).await.unwrap();
    assert_eq!(store.find(webhook.id).await.unwrap().failure_count, 1);

    dispatcher.dispatch(&task_event("task.created")).await.unwrap();
    let updated = store.find(webhook.id).await.unwrap();
    assert_eq!(updated.failure_count, 0, "any success resets the counter");
    assert!(updated.last_success_at.is_some());
}

#[tokio::test]
async fn connection_error_is_recorded_not_thrown() {
    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);
    // Nothing listens here.
    let webhook = register(&dispatcher, "http://127.0.0.1:9", &["task.*"], Some("s")).await;

    let attempted = dispatcher.dispatch(&task_event("task.created")).await.unwrap();
    assert_eq!(attempted, 1);

    let deliveries = dispatcher.deliveries(webhook.id, "tenant-1", 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(!deliveries[0].success);
    assert!(deliveries[0].status_code.is_none());
    assert!(deliveries[0].error.is_some());
}

#[tokio::test]
async fn only_matching_patterns_and_active_webhooks_fire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);

    // Subscribed to project events only: must not fire for a task event.
    register(&dispatcher, &server.uri(), &["project.*"], Some("s")).await;
    // Match-all but inactive: must not fire either.
    let inactive = register(&dispatcher, &server.uri(), &["*"], Some("s")).await;
    store
        .update(
            inactive.id,
            "tenant-1",
            taskflow_core::webhook::WebhookUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // Subscribed to task events: fires.
    register(&dispatcher, &server.uri(), &["task.*"], Some("s")).await;

    let attempted = dispatcher.dispatch(&task_event("task.created")).await.unwrap();
    assert_eq!(attempted, 1);
}

#[tokio::test]
async fn events_without_tenant_are_skipped() {
    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);

    let event = DomainEvent::new(
        "task.created",
        serde_json::json!({}),
        EventMetadata::default(),
        Utc::now(),
    );
    assert_eq!(dispatcher.dispatch(&event).await.unwrap(), 0);
}

#[tokio::test]
async fn replayed_events_are_not_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);
    register(&dispatcher, &server.uri(), &["task.*"], Some("s")).await;

    let replayed = task_event("task.created").into_replay(Uuid::new_v4(), Utc::now());
    dispatcher.handle(replayed).await.unwrap();
}

#[tokio::test]
async fn retry_delivery_reexecutes_and_counts() {
    let server = MockServer::start().await;
    // First attempt fails, the manual retry succeeds.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);
    let webhook = register(&dispatcher, &server.uri(), &["task.*"], Some("s")).await;

    dispatcher.dispatch(&task_event("task.created")).await.unwrap();
    let failed = dispatcher.deliveries(webhook.id, "tenant-1", 10).await.unwrap()[0].clone();
    assert!(!failed.success);

    let retried = dispatcher.retry_delivery(failed.id, "tenant-1").await.unwrap();
    assert!(retried.success);
    assert_eq!(retried.retry_count, 1);

    // The original record carries the manual retry count; the new attempt
    // is its own audit row.
    let all = dispatcher.deliveries(webhook.id, "tenant-1", 10).await.unwrap();
    assert_eq!(all.len(), 2);
    let original = all.iter().find(|d| d.id == failed.id).unwrap();
    assert_eq!(original.retry_count, 1);
}

#[tokio::test]
async fn create_webhook_generates_secret_when_missing() {
    let store = Arc::new(InMemoryWebhookStore::new());
    let dispatcher = dispatcher(&store);

    let webhook = dispatcher
        .create_webhook(NewWebhook {
            tenant_id: "tenant-1".to_string(),
            name: "hook".to_string(),
            url: "https://example.com".to_string(),
            events: vec!["*".parse().unwrap()],
            secret: None,
        })
        .await
        .unwrap();

    assert_eq!(webhook.secret.len(), 64);
    assert!(webhook.is_active);
}
