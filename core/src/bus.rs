//! In-process event bus with an explicit subscription registry.
//!
//! The bus fans events from inbox-delivered broker messages and from direct
//! in-process emission out to listeners: audit, notifications, realtime,
//! the webhook dispatcher, saga triggers. Subscriptions are explicit
//! registration calls made during startup wiring — there is no ambient
//! global registry — so tests can build isolated buses.
//!
//! # Dispatch semantics
//!
//! `publish` evaluates every subscription's [`EventPattern`] against the
//! event type and awaits matching handlers **sequentially, in registration
//! order**. The first handler error aborts dispatch and is returned to the
//! caller: the inbox uses that outcome to decide whether a message counts
//! as processed. Cross-event concurrency belongs to the callers (the
//! consumer loop runs messages concurrently; the webhook dispatcher fans
//! out internally).
//!
//! # Example
//!
//! ```
//! use taskflow_core::bus::{EventBus, EventHandler, HandlerError};
//! use taskflow_core::event::{DomainEvent, EventMetadata};
//! use std::future::Future;
//! use std::pin::Pin;
//!
//! struct CountingHandler;
//!
//! impl EventHandler for CountingHandler {
//!     fn name(&self) -> &str {
//!         "counting"
//!     }
//!
//!     fn handle(
//!         &self,
//!         _event: DomainEvent,
//!     ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = EventBus::new();
//! bus.subscribe("task.*".parse()?, std::sync::Arc::new(CountingHandler)).await;
//!
//! let event = DomainEvent::new(
//!     "task.created",
//!     serde_json::json!({}),
//!     EventMetadata::default(),
//!     chrono::Utc::now(),
//! );
//! bus.publish(&event).await?;
//! # Ok(())
//! # }
//! ```

use crate::event::DomainEvent;
use crate::pattern::EventPattern;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Error produced by an event handler.
///
/// Handlers collapse their internal errors into a message string; the
/// delivery machinery needs to count and record failures, not interpret
/// them.
#[derive(Error, Debug, Clone)]
#[error("Handler '{handler}' failed: {message}")]
pub struct HandlerError {
    /// Name of the failing handler.
    pub handler: String,
    /// Error description recorded on the inbox/DLQ row.
    pub message: String,
}

impl HandlerError {
    /// Create a handler error.
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// An in-process subscriber to domain events.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so handlers can be stored
/// as `Arc<dyn EventHandler>` in the registry.
pub trait EventHandler: Send + Sync {
    /// Stable handler name, recorded as `processed_by` on inbox rows and in
    /// logs.
    fn name(&self) -> &str;

    /// Handle one event. Called once per matching published event.
    fn handle(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}

struct Subscription {
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
}

/// In-process event bus.
///
/// Cheap to clone via `Arc`; the registry is behind an async `RwLock` so
/// startup wiring and dispatch can interleave safely.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events matching `pattern`.
    ///
    /// Handlers fire in registration order.
    pub async fn subscribe(&self, pattern: EventPattern, handler: Arc<dyn EventHandler>) {
        tracing::debug!(
            pattern = %pattern,
            handler = handler.name(),
            "Handler subscribed"
        );
        self.subscriptions
            .write()
            .await
            .push(Subscription { pattern, handler });
    }

    /// Number of registered subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Dispatch `event` to every matching handler, in registration order.
    ///
    /// Returns after all matching handlers have completed. The first
    /// handler error aborts dispatch and is returned.
    ///
    /// # Errors
    ///
    /// Returns the first [`HandlerError`] raised by a matching handler.
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| s.pattern.matches(&event.event_type))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        if handlers.is_empty() {
            tracing::trace!(event_type = %event.event_type, "No handlers for event");
            return Ok(());
        }

        for handler in handlers {
            if let Err(err) = handler.handle(event.clone()).await {
                tracing::error!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    handler = err.handler,
                    error = %err.message,
                    "Event handler failed"
                );
                return Err(err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: String,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(
            &self,
            _event: DomainEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(HandlerError::new(self.name.clone(), "boom"))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn event(event_type: &str) -> DomainEvent {
        DomainEvent::new(
            event_type,
            serde_json::json!({}),
            EventMetadata::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn dispatches_to_matching_handlers_only() {
        let bus = EventBus::new();
        let tasks = Recorder::new("tasks", false);
        let projects = Recorder::new("projects", false);

        bus.subscribe("task.*".parse().unwrap(), Arc::clone(&tasks) as _).await;
        bus.subscribe("project.*".parse().unwrap(), Arc::clone(&projects) as _).await;

        bus.publish(&event("task.created")).await.unwrap();

        assert_eq!(tasks.calls(), 1);
        assert_eq!(projects.calls(), 0);
    }

    #[tokio::test]
    async fn match_all_sees_everything() {
        let bus = EventBus::new();
        let all = Recorder::new("all", false);
        bus.subscribe(EventPattern::match_all(), Arc::clone(&all) as _).await;

        bus.publish(&event("task.created")).await.unwrap();
        bus.publish(&event("user.logged_in")).await.unwrap();

        assert_eq!(all.calls(), 2);
    }

    #[tokio::test]
    async fn first_handler_error_aborts_dispatch() {
        let bus = EventBus::new();
        let failing = Recorder::new("failing", true);
        let after = Recorder::new("after", false);

        bus.subscribe(EventPattern::match_all(), Arc::clone(&failing) as _).await;
        bus.subscribe(EventPattern::match_all(), Arc::clone(&after) as _).await;

        let err = bus.publish(&event("task.created")).await.unwrap_err();

        assert_eq!(err.handler, "failing");
        assert_eq!(failing.calls(), 1);
        assert_eq!(after.calls(), 0);
    }

    #[tokio::test]
    async fn publish_without_handlers_is_ok() {
        let bus = EventBus::new();
        bus.publish(&event("task.created")).await.unwrap();
    }
}
