//! Event store trait and related types.
//!
//! The event store is the append-only, versioned log of domain events per
//! aggregate. An aggregate is identified by `(aggregate_id, aggregate_type)`
//! and its history is a gapless version sequence starting at 1.
//!
//! # Design
//!
//! Unlike an optimistic-concurrency store where callers assert an expected
//! version, `append_event` here computes the next version itself inside one
//! serializable write: concurrent appenders to the same aggregate are
//! ordered by the implementation (unique constraint on the version triple
//! plus retry-on-conflict, or an equivalent lock). Callers never see or
//! supply version numbers on the write path.
//!
//! Rebuilding state is a pure fold over the history via [`EventFolder`];
//! an unknown event type leaves the state unchanged, so old readers survive
//! events appended by newer writers.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `taskflow-postgres`): production
//! - `InMemoryEventStore` (in `taskflow-testing`): deterministic testing

use crate::event::EventMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Concurrent appenders exhausted the conflict-retry budget.
    ///
    /// The unique constraint on `(aggregate_id, aggregate_type, version)`
    /// rejected every attempted version. Seeing this error means the
    /// aggregate is under pathological write contention.
    #[error("Version conflict on aggregate {aggregate_type}/{aggregate_id} after {attempts} attempts")]
    VersionConflict {
        /// The contended aggregate id.
        aggregate_id: String,
        /// The contended aggregate type.
        aggregate_type: String,
        /// How many append attempts were made.
        attempts: u32,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Event version within an aggregate's history.
///
/// Versions start at 1 and increment by 1 per appended event, with no gaps.
///
/// # Examples
///
/// ```
/// use taskflow_core::event_store::Version;
///
/// let first = Version::FIRST;
/// assert_eq!(first.value(), 1);
/// assert_eq!(first.next(), Version::new(2));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(i64);

impl Version {
    /// The version of the first event in any aggregate history.
    pub const FIRST: Self = Self(1);

    /// Create a version with the given value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// The version number.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// The next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// An event to append, before the store assigns id/version/timestamp order.
#[derive(Clone, Debug)]
pub struct NewEvent {
    /// Aggregate instance id.
    pub aggregate_id: String,
    /// Aggregate type, e.g. `"task"`.
    pub aggregate_type: String,
    /// Dot-delimited event type.
    pub event_type: String,
    /// Opaque JSON event data.
    pub event_data: serde_json::Value,
    /// Delivery metadata.
    pub metadata: EventMetadata,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// A persisted event-store record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique record id.
    pub id: Uuid,
    /// Aggregate instance id.
    pub aggregate_id: String,
    /// Aggregate type.
    pub aggregate_type: String,
    /// Dot-delimited event type.
    pub event_type: String,
    /// Position in the aggregate's history (gapless, from 1).
    pub version: Version,
    /// Opaque JSON event data.
    pub event_data: serde_json::Value,
    /// Delivery metadata.
    pub metadata: EventMetadata,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// One row of the per-type event statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeCount {
    /// The event type.
    pub event_type: String,
    /// Calendar day (UTC) the events occurred on.
    pub day: chrono::NaiveDate,
    /// Number of events of this type on this day.
    pub count: i64,
}

/// Append-only, versioned event log per aggregate.
pub trait EventStore: Send + Sync {
    /// Append one event, assigning it the aggregate's next version.
    ///
    /// Concurrent appends to the same aggregate are serialized by the
    /// implementation; the returned record carries the assigned version.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::VersionConflict`]: contention exhausted the
    ///   retry budget
    /// - [`EventStoreError::Database`]: storage failure
    fn append_event(
        &self,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, EventStoreError>> + Send + '_>>;

    /// All events of one aggregate, ascending by version.
    ///
    /// An unknown aggregate yields an empty vector, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] on storage failure.
    fn aggregate_events(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>>;

    /// Events in `[start, end]` ordered by `occurred_at` ascending,
    /// optionally restricted to the given event types.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] on storage failure.
    fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        event_types: Option<&[String]>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>>;

    /// Per-type, per-day event counts since `since` (operator statistics).
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] on storage failure.
    fn type_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventTypeCount>, EventStoreError>> + Send + '_>>;
}

/// A pure per-event-type reducer used to rebuild aggregate state.
///
/// `apply` must be pure: same state + same event = same result, no I/O.
/// Implementations ignore event types they do not recognize, which is what
/// makes the fold forward-compatible.
pub trait EventFolder {
    /// The aggregate state being rebuilt.
    type State: Default;

    /// Fold one event into the state. Unknown event types must leave the
    /// state unchanged.
    fn apply(state: &mut Self::State, event: &StoredEvent);
}

/// Rebuild aggregate state by folding `events` through `F`.
///
/// Events must be in ascending version order (as returned by
/// [`EventStore::aggregate_events`]).
#[must_use]
pub fn fold_events<F: EventFolder>(events: &[StoredEvent]) -> F::State {
    let mut state = F::State::default();
    for event in events {
        F::apply(&mut state, event);
    }
    state
}
