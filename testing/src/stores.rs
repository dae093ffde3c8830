//! In-memory implementations of the `taskflow-core` store traits.
//!
//! Each store guards its state with a mutex and reproduces the semantics
//! the production SQL relies on: unique-key inserts, conditional updates
//! that report whether the caller won, atomic batch claims with lease
//! extension. Locks are never held across await points.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use taskflow_core::dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterStats, DeadLetterStore, NewDeadLetter,
};
use taskflow_core::event_store::{
    EventStore, EventStoreError, EventTypeCount, NewEvent, StoredEvent, Version,
};
use taskflow_core::inbox::{InboxError, InboxMessage, InboxStore, NewInboxMessage};
use taskflow_core::outbox::{NewOutboxMessage, OutboxError, OutboxMessage, OutboxStore};
use taskflow_core::saga::{SagaError, SagaExecution, SagaStatRow, SagaStore};
use taskflow_core::webhook::{
    Webhook, WebhookDelivery, WebhookError, WebhookStore, WebhookUpdate,
};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ===== Event store =====

/// In-memory [`EventStore`].
///
/// Appends are serialized by the store mutex, so per-aggregate version
/// sequences are gapless under concurrent appenders by construction.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events (test assertions).
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }
}

impl EventStore for InMemoryEventStore {
    fn append_event(
        &self,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut events = lock(&self.events);
            let last = events
                .iter()
                .filter(|e| {
                    e.aggregate_id == event.aggregate_id
                        && e.aggregate_type == event.aggregate_type
                })
                .map(|e| e.version.value())
                .max()
                .unwrap_or(0);

            let stored = StoredEvent {
                id: Uuid::new_v4(),
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                event_type: event.event_type,
                version: Version::new(last + 1),
                event_data: event.event_data,
                metadata: event.metadata,
                occurred_at: event.occurred_at,
            };
            events.push(stored.clone());
            Ok(stored)
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
            let mut matching: Vec<StoredEvent> = lock(&self.events)
                .iter()
                .filter(|e| e.aggregate_id == aggregate_id && e.aggregate_type == aggregate_type)
                .cloned()
                .collect();
            matching.sort_by_key(|e| e.version);
            Ok(matching)
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
            let mut matching: Vec<StoredEvent> = lock(&self.events)
                .iter()
                .filter(|e| e.occurred_at >= start && e.occurred_at <= end)
                .filter(|e| {
                    event_types
                        .as_ref()
                        .is_none_or(|types| types.contains(&e.event_type))
                })
                .cloned()
                .collect();
            matching.sort_by_key(|e| e.occurred_at);
            Ok(matching)
        })
    }

    fn type_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventTypeCount>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut counts: HashMap<(String, chrono::NaiveDate), i64> = HashMap::new();
            for event in lock(&self.events).iter().filter(|e| e.occurred_at >= since) {
                *counts
                    .entry((event.event_type.clone(), event.occurred_at.date_naive()))
                    .or_insert(0) += 1;
            }

            let mut rows: Vec<EventTypeCount> = counts
                .into_iter()
                .map(|((event_type, day), count)| EventTypeCount {
                    event_type,
                    day,
                    count,
                })
                .collect();
            rows.sort_by(|a, b| a.day.cmp(&b.day).then(a.event_type.cmp(&b.event_type)));
            Ok(rows)
        })
    }
}

// ===== Outbox =====

/// In-memory [`OutboxStore`].
#[derive(Default)]
pub struct InMemoryOutboxStore {
    messages: Mutex<Vec<OutboxMessage>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all messages (test assertions).
    #[must_use]
    pub fn all(&self) -> Vec<OutboxMessage> {
        lock(&self.messages).clone()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn enqueue(
        &self,
        message: NewOutboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxMessage, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let now = Utc::now();
            let stored = OutboxMessage {
                id: Uuid::new_v4(),
                aggregate_id: message.aggregate_id,
                aggregate_type: message.aggregate_type,
                event_type: message.event_type,
                payload: message.payload,
                processed: false,
                processed_at: None,
                retry_count: 0,
                error: None,
                available_at: now,
                created_at: now,
            };
            lock(&self.messages).push(stored.clone());
            Ok(stored)
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
            let mut messages = lock(&self.messages);

            let mut eligible: Vec<usize> = messages
                .iter()
                .enumerate()
                .filter(|(_, m)| {
                    !m.processed && m.retry_count < max_retries && m.available_at <= now
                })
                .map(|(i, _)| i)
                .collect();
            eligible.sort_by_key(|&i| messages[i].created_at);
            eligible.truncate(limit);

            let mut claimed = Vec::with_capacity(eligible.len());
            for index in eligible {
                messages[index].available_at = now + lease;
                claimed.push(messages[index].clone());
            }
            Ok(claimed)
        })
    }

    fn mark_processed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut messages = lock(&self.messages);
            match messages.iter_mut().find(|m| m.id == id && !m.processed) {
                Some(message) => {
                    message.processed = true;
                    message.processed_at = Some(at);
                    Ok(true)
                },
                None => Ok(false),
            }
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
            let mut messages = lock(&self.messages);
            let message = messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(OutboxError::NotFound(id))?;
            message.retry_count += 1;
            message.error = Some(error);
            message.available_at = next_attempt_at;
            Ok(())
        })
    }

    fn exhausted_count(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let count = lock(&self.messages)
                .iter()
                .filter(|m| !m.processed && m.retry_count >= max_retries)
                .count();
            Ok(count as i64)
        })
    }

    fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut messages = lock(&self.messages);
            let before = messages.len();
            messages.retain(|m| {
                !(m.processed && m.processed_at.is_some_and(|at| at < cutoff))
            });
            Ok((before - messages.len()) as u64)
        })
    }
}

// ===== Inbox =====

/// In-memory [`InboxStore`].
#[derive(Default)]
pub struct InMemoryInboxStore {
    messages: Mutex<HashMap<String, InboxMessage>>,
}

impl InMemoryInboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all messages (test assertions).
    #[must_use]
    pub fn all(&self) -> Vec<InboxMessage> {
        lock(&self.messages).values().cloned().collect()
    }
}

impl InboxStore for InMemoryInboxStore {
    fn find(
        &self,
        message_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<InboxMessage>, InboxError>> + Send + '_>> {
        let message_id = message_id.to_string();
        Box::pin(async move { Ok(lock(&self.messages).get(&message_id).cloned()) })
    }

    fn insert_pending(
        &self,
        message: NewInboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<InboxMessage, InboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut messages = lock(&self.messages);
            let entry = messages
                .entry(message.message_id.clone())
                .or_insert_with(|| InboxMessage {
                    id: Uuid::new_v4(),
                    message_id: message.message_id.clone(),
                    event_type: message.event_type,
                    payload: message.payload,
                    source: message.source,
                    processed: false,
                    processed_at: None,
                    processed_by: None,
                    retry_count: 0,
                    error: None,
                    expires_at: message.expires_at,
                    created_at: Utc::now(),
                });
            Ok(entry.clone())
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
            let mut messages = lock(&self.messages);
            match messages.get_mut(&message_id) {
                Some(message) if !message.processed => {
                    message.processed = true;
                    message.processed_at = Some(at);
                    message.processed_by = Some(processed_by);
                    Ok(true)
                },
                _ => Ok(false),
            }
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
            let mut messages = lock(&self.messages);
            let message = messages
                .get_mut(&message_id)
                .ok_or(InboxError::NotFound(message_id.clone()))?;
            message.retry_count += 1;
            message.error = Some(error);
            Ok(message.retry_count)
        })
    }

    fn stuck(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InboxMessage>, InboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut stuck: Vec<InboxMessage> = lock(&self.messages)
                .values()
                .filter(|m| !m.processed)
                .cloned()
                .collect();
            stuck.sort_by_key(|m| m.created_at);
            stuck.truncate(limit);
            Ok(stuck)
        })
    }

    fn delete_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, InboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut messages = lock(&self.messages);
            let before = messages.len();
            messages.retain(|_, m| !(m.processed && m.expires_at <= now));
            Ok((before - messages.len()) as u64)
        })
    }
}

// ===== Dead letter queue =====

/// In-memory [`DeadLetterStore`].
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries (test assertions).
    #[must_use]
    pub fn all(&self) -> Vec<DeadLetter> {
        lock(&self.entries).clone()
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn insert(
        &self,
        dead_letter: NewDeadLetter,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = lock(&self.entries);

            // Dedupe on the open entry for this message id.
            if let Some(existing) = entries
                .iter_mut()
                .find(|e| !e.resolved && e.original_message_id == dead_letter.original_message_id)
            {
                existing.last_failed_at = now;
                existing.attempt_count = dead_letter.attempt_count;
                existing.failure_reason = dead_letter.failure_reason;
                return Ok(existing.clone());
            }

            let entry = DeadLetter {
                id: Uuid::new_v4(),
                original_message_id: dead_letter.original_message_id,
                event_type: dead_letter.event_type,
                payload: dead_letter.payload,
                source: dead_letter.source,
                failure_reason: dead_letter.failure_reason,
                attempt_count: dead_letter.attempt_count,
                first_failed_at: now,
                last_failed_at: now,
                resolved: false,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            };
            entries.push(entry.clone());
            Ok(entry)
        })
    }

    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.entries)
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or(DeadLetterError::NotFound(id))
        })
    }

    fn unresolved(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let mut unresolved: Vec<DeadLetter> = lock(&self.entries)
                .iter()
                .filter(|e| !e.resolved)
                .cloned()
                .collect();
            unresolved.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
            unresolved.truncate(limit);
            Ok(unresolved)
        })
    }

    fn unresolved_by_event_type(
        &self,
        event_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>> {
        let event_type = event_type.to_string();

        Box::pin(async move {
            let mut matching: Vec<DeadLetter> = lock(&self.entries)
                .iter()
                .filter(|e| !e.resolved && e.event_type == event_type)
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
            Ok(matching)
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
            let mut entries = lock(&self.entries);
            let entry = entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(DeadLetterError::NotFound(id))?;
            entry.resolved = true;
            entry.resolved_at = Some(at);
            entry.resolved_by = Some(resolved_by);
            entry.resolution_notes = Some(notes);
            Ok(())
        })
    }

    fn stats(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetterStats, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let entries = lock(&self.entries);
            let total = entries.len() as i64;
            let resolved = entries.iter().filter(|e| e.resolved).count() as i64;

            let mut by_type: HashMap<String, i64> = HashMap::new();
            for entry in entries.iter().filter(|e| !e.resolved) {
                *by_type.entry(entry.event_type.clone()).or_insert(0) += 1;
            }
            let mut by_event_type: Vec<(String, i64)> = by_type.into_iter().collect();
            by_event_type.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            Ok(DeadLetterStats {
                total,
                resolved,
                unresolved: total - resolved,
                by_event_type,
            })
        })
    }
}

// ===== Saga store =====

/// In-memory [`SagaStore`].
#[derive(Default)]
pub struct InMemorySagaStore {
    executions: Mutex<HashMap<Uuid, SagaExecution>>,
}

impl InMemorySagaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SagaStore for InMemorySagaStore {
    fn insert(
        &self,
        execution: &SagaExecution,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
        let execution = execution.clone();
        Box::pin(async move {
            lock(&self.executions).insert(execution.id, execution);
            Ok(())
        })
    }

    fn update(
        &self,
        execution: &SagaExecution,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
        let execution = execution.clone();
        Box::pin(async move {
            let mut executions = lock(&self.executions);
            if !executions.contains_key(&execution.id) {
                return Err(SagaError::ExecutionNotFound(execution.id));
            }
            executions.insert(execution.id, execution);
            Ok(())
        })
    }

    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<SagaExecution, SagaError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.executions)
                .get(&id)
                .cloned()
                .ok_or(SagaError::ExecutionNotFound(id))
        })
    }

    fn history(
        &self,
        saga_name: Option<&str>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaExecution>, SagaError>> + Send + '_>> {
        let saga_name = saga_name.map(ToString::to_string);

        Box::pin(async move {
            let mut executions: Vec<SagaExecution> = lock(&self.executions)
                .values()
                .filter(|e| saga_name.as_ref().is_none_or(|name| &e.saga_name == name))
                .cloned()
                .collect();
            executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            executions.truncate(limit);
            Ok(executions)
        })
    }

    fn stats(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaStatRow>, SagaError>> + Send + '_>> {
        Box::pin(async move {
            let mut counts: HashMap<(String, &'static str), (taskflow_core::saga::SagaStatus, i64)> =
                HashMap::new();
            for execution in lock(&self.executions).values() {
                let key = (execution.saga_name.clone(), execution.status.as_str());
                counts
                    .entry(key)
                    .and_modify(|(_, count)| *count += 1)
                    .or_insert((execution.status, 1));
            }

            let mut rows: Vec<SagaStatRow> = counts
                .into_iter()
                .map(|((saga_name, _), (status, count))| SagaStatRow {
                    saga_name,
                    status,
                    count,
                })
                .collect();
            rows.sort_by(|a, b| {
                a.saga_name
                    .cmp(&b.saga_name)
                    .then(a.status.as_str().cmp(b.status.as_str()))
            });
            Ok(rows)
        })
    }
}

// ===== Webhook store =====

/// In-memory [`WebhookStore`].
#[derive(Default)]
pub struct InMemoryWebhookStore {
    webhooks: Mutex<HashMap<Uuid, Webhook>>,
    deliveries: Mutex<Vec<WebhookDelivery>>,
}

impl InMemoryWebhookStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all delivery records (test assertions).
    #[must_use]
    pub fn all_deliveries(&self) -> Vec<WebhookDelivery> {
        lock(&self.deliveries).clone()
    }
}

impl WebhookStore for InMemoryWebhookStore {
    fn create(
        &self,
        webhook: Webhook,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.webhooks).insert(webhook.id, webhook.clone());
            Ok(webhook)
        })
    }

    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Webhook, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.webhooks)
                .get(&id)
                .cloned()
                .ok_or(WebhookError::NotFound(id))
        })
    }

    fn for_tenant(
        &self,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>, WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            let mut webhooks: Vec<Webhook> = lock(&self.webhooks)
                .values()
                .filter(|w| w.tenant_id == tenant_id)
                .cloned()
                .collect();
            webhooks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(webhooks)
        })
    }

    fn active_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>, WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            let mut webhooks: Vec<Webhook> = lock(&self.webhooks)
                .values()
                .filter(|w| w.tenant_id == tenant_id && w.is_active)
                .cloned()
                .collect();
            webhooks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(webhooks)
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
            let mut webhooks = lock(&self.webhooks);
            let webhook = webhooks
                .get_mut(&id)
                .filter(|w| w.tenant_id == tenant_id)
                .ok_or(WebhookError::NotFound(id))?;
            if let Some(url) = update.url {
                webhook.url = url;
            }
            if let Some(events) = update.events {
                webhook.events = events;
            }
            if let Some(is_active) = update.is_active {
                webhook.is_active = is_active;
            }
            Ok(webhook.clone())
        })
    }

    fn delete(
        &self,
        id: Uuid,
        tenant_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        let tenant_id = tenant_id.to_string();

        Box::pin(async move {
            lock(&self.webhooks).retain(|_, w| !(w.id == id && w.tenant_id == tenant_id));
            Ok(())
        })
    }

    fn record_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let mut webhooks = lock(&self.webhooks);
            let webhook = webhooks.get_mut(&id).ok_or(WebhookError::NotFound(id))?;
            webhook.failure_count = 0;
            webhook.last_success_at = Some(at);
            Ok(())
        })
    }

    fn record_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let mut webhooks = lock(&self.webhooks);
            let webhook = webhooks.get_mut(&id).ok_or(WebhookError::NotFound(id))?;
            webhook.failure_count += 1;
            webhook.last_failure_at = Some(at);
            Ok(())
        })
    }

    fn insert_delivery(
        &self,
        delivery: WebhookDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.deliveries).push(delivery);
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
            lock(&self.deliveries)
                .iter()
                .find(|d| d.id == id && d.tenant_id == tenant_id)
                .cloned()
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
            let mut matching: Vec<WebhookDelivery> = lock(&self.deliveries)
                .iter()
                .filter(|d| d.webhook_id == webhook_id && d.tenant_id == tenant_id)
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            matching.truncate(limit);
            Ok(matching)
        })
    }

    fn increment_delivery_retry(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let mut deliveries = lock(&self.deliveries);
            let delivery = deliveries
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or(WebhookError::DeliveryNotFound(id))?;
            delivery.retry_count += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use taskflow_core::event::EventMetadata;

    fn new_event(aggregate_id: &str, event_type: &str) -> NewEvent {
        NewEvent {
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: "task".to_string(),
            event_type: event_type.to_string(),
            event_data: serde_json::json!({}),
            metadata: EventMetadata::default(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn event_store_versions_are_gapless() {
        let store = InMemoryEventStore::new();
        for _ in 0..3 {
            store.append_event(new_event("t-1", "task.updated")).await.unwrap();
        }
        store.append_event(new_event("t-2", "task.created")).await.unwrap();

        let events = store.aggregate_events("t-1", "task").await.unwrap();
        let versions: Vec<i64> = events.iter().map(|e| e.version.value()).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let other = store.aggregate_events("t-2", "task").await.unwrap();
        assert_eq!(other[0].version, Version::FIRST);
    }

    #[tokio::test]
    async fn outbox_claim_is_exclusive_and_leased() {
        let store = InMemoryOutboxStore::new();
        let message = store
            .enqueue(NewOutboxMessage::new("t-1", "task", "task.created", serde_json::json!({})))
            .await
            .unwrap();

        let now = Utc::now();
        let lease = chrono::Duration::seconds(60);
        let first = store.claim_batch(10, 5, now, lease).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, message.id);

        // Same instant: the lease hides the message from a second claimant.
        let second = store.claim_batch(10, 5, now, lease).await.unwrap();
        assert!(second.is_empty());

        // After the lease expires it becomes claimable again.
        let later = now + chrono::Duration::seconds(120);
        let third = store.claim_batch(10, 5, later, lease).await.unwrap();
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn inbox_mark_processed_is_conditional() {
        let store = InMemoryInboxStore::new();
        let now = Utc::now();
        store
            .insert_pending(NewInboxMessage {
                message_id: "m-1".to_string(),
                event_type: "task.created".to_string(),
                payload: serde_json::json!({}),
                source: "test".to_string(),
                expires_at: now + chrono::Duration::days(7),
            })
            .await
            .unwrap();

        assert!(store.mark_processed("m-1", "handler", now).await.unwrap());
        assert!(!store.mark_processed("m-1", "handler", now).await.unwrap());
    }

    #[tokio::test]
    async fn dead_letter_insert_dedupes_open_entries() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let new_entry = |attempts: i32| NewDeadLetter {
            original_message_id: "m-1".to_string(),
            event_type: "task.created".to_string(),
            payload: serde_json::json!({}),
            source: "test".to_string(),
            failure_reason: "boom".to_string(),
            attempt_count: attempts,
        };

        let first = store.insert(new_entry(5), now).await.unwrap();
        let second = store.insert(new_entry(6), now + chrono::Duration::hours(1)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt_count, 6);
        assert_eq!(store.all().len(), 1);
    }
}
