//! `PostgreSQL` store implementations for the Taskflow event-delivery
//! subsystem.
//!
//! This crate implements every store trait from `taskflow-core` on top of
//! sqlx and `PostgreSQL`:
//!
//! - [`PostgresEventStore`]: append-only event log with per-aggregate
//!   version assignment under a unique constraint
//! - [`PostgresOutboxStore`]: transactional outbox with
//!   `FOR UPDATE SKIP LOCKED` batch claims
//! - [`PostgresInboxStore`]: unique-key deduplication with conditional
//!   completion updates
//! - [`PostgresDeadLetterStore`]: dead-letter queue with open-entry dedup
//! - [`PostgresSagaStore`]: saga execution ledgers
//! - [`PostgresWebhookStore`]: webhook registrations and delivery audit
//!
//! # Multi-instance safety
//!
//! Every claim/update that two process instances could race on is a single
//! conditional statement (`UPDATE … WHERE processed = false`,
//! `ON CONFLICT DO NOTHING`, `FOR UPDATE SKIP LOCKED`) — correctness never
//! depends on application-level check-then-act.
//!
//! # Schema
//!
//! Each store module documents the table it owns. The integration tests
//! create the schema inline; production deployments own their migration
//! tooling.
//!
//! # Example
//!
//! ```no_run
//! use taskflow_postgres::PostgresInboxStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/taskflow").await?;
//! let inbox = PostgresInboxStore::new(pool);
//! # let _ = inbox;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod dead_letter_queue;
mod event_store;
mod inbox;
mod outbox;
mod saga_store;
mod webhook_store;

pub use dead_letter_queue::PostgresDeadLetterStore;
pub use event_store::PostgresEventStore;
pub use inbox::PostgresInboxStore;
pub use outbox::PostgresOutboxStore;
pub use saga_store::PostgresSagaStore;
pub use webhook_store::PostgresWebhookStore;
