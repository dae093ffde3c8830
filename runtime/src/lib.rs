//! # Taskflow Runtime
//!
//! Operational services for the Taskflow event-delivery subsystem: the
//! code that actually moves messages, built on the traits in
//! `taskflow-core`.
//!
//! - [`outbox`]: background publisher draining the transactional outbox to
//!   the broker, plus the retention sweep
//! - [`inbox`]: the idempotent message-processing algorithm and expiry
//!   sweep
//! - [`consumer`]: the broker → inbox → event-bus consumer loop
//! - [`dlq`]: dead-letter escalation sweep and the manual retry/resolve
//!   surface
//! - [`saga`]: the saga orchestrator (sequential steps, best-effort total
//!   compensation)
//! - [`webhook`]: tenant webhook fan-out with HMAC-signed deliveries
//! - [`event_store`]: append/rebuild/replay service over the event log
//! - [`scheduler`]: periodic task spawning shared by all sweeps
//! - [`retry`]: retry policy with exponential backoff
//! - [`metrics`]: Prometheus metrics registration and rendering
//!
//! # Wiring
//!
//! Services take their dependencies as `Arc`ed trait objects and are
//! themselves cheap to share. A process wires them once at startup:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskflow_core::environment::SystemClock;
//! use taskflow_runtime::outbox::{OutboxPublisher, OutboxPublisherConfig};
//! use taskflow_testing::{InMemoryBroker, stores::InMemoryOutboxStore};
//!
//! # fn example() {
//! let publisher = Arc::new(OutboxPublisher::new(
//!     Arc::new(InMemoryOutboxStore::new()),
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(SystemClock),
//!     OutboxPublisherConfig::default(),
//! ));
//! let handle = OutboxPublisher::spawn(&publisher, Duration::from_secs(5));
//! # drop(handle);
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod consumer;
pub mod dlq;
pub mod event_store;
pub mod inbox;
pub mod metrics;
pub mod outbox;
pub mod retry;
pub mod saga;
pub mod scheduler;
pub mod webhook;

pub use consumer::BrokerConsumer;
pub use dlq::{DeadLetterService, RetryOutcome};
pub use event_store::{EventStoreService, ReplayReport};
pub use inbox::InboxProcessor;
pub use outbox::{OutboxPublisher, OutboxPublisherConfig};
pub use retry::RetryPolicy;
pub use saga::SagaOrchestrator;
pub use webhook::{WebhookDispatcher, WebhookDispatcherConfig};
