//! # Taskflow Core
//!
//! Core traits and types for the Taskflow asynchronous event-delivery
//! subsystem.
//!
//! This crate defines the storage-agnostic contracts that the rest of the
//! workspace implements and composes:
//!
//! - [`event`]: the domain event envelope that flows through every component
//! - [`pattern`]: deterministic wildcard matching over dot-delimited event types
//! - [`bus`]: the in-process event bus (explicit subscription registry)
//! - [`broker`]: the external message-broker transport trait
//! - [`event_store`]: append-only, versioned event log per aggregate
//! - [`outbox`]: transactional outbox records and store trait
//! - [`inbox`]: deduplicating inbox records and store trait
//! - [`dead_letter`]: dead-letter queue records and store trait
//! - [`saga`]: saga definitions, executions, and the saga store trait
//! - [`webhook`]: webhook registrations, delivery records, and store trait
//!
//! ## Architecture
//!
//! ```text
//! business tx ──► Outbox ──► publisher ──► Broker ──► consumer ──► Inbox
//!      │                                                            │
//!      └──► Event Store                                   in-process bus
//!                                                       ┌──────┬─────┴────┐
//!                                                       ▼      ▼          ▼
//!                                                  listeners  sagas  webhooks
//! ```
//!
//! Store traits here are deliberately minimal: they describe the atomic
//! claim/update operations the delivery guarantees depend on (conditional
//! updates, unique-key inserts), not convenience query surfaces. Production
//! implementations live in `taskflow-postgres`; deterministic in-memory
//! implementations live in `taskflow-testing`.
//!
//! ## Dyn Compatibility
//!
//! All store and transport traits use explicit `Pin<Box<dyn Future>>` returns
//! instead of `async fn` so they can be held as trait objects
//! (`Arc<dyn EventStore>`, `Arc<dyn Broker>`) and shared across the runtime's
//! background tasks.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod broker;
pub mod bus;
pub mod dead_letter;
pub mod event;
pub mod event_store;
pub mod inbox;
pub mod outbox;
pub mod pattern;
pub mod saga;
pub mod webhook;

/// Environment module - dependency injection traits.
///
/// All external dependencies are abstracted behind traits and injected into
/// the runtime services, keeping them deterministic under test.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskflow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let now = clock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time.
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
