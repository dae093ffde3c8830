//! Event store service: append, rebuild, replay, statistics.
//!
//! A thin operational layer over the [`EventStore`] trait. Appending goes
//! straight to the store (version assignment lives there); rebuilding is
//! the pure [`EventFolder`] fold; replay re-emits stored events over the
//! in-process bus with the replay tag set, so handlers can tell a
//! reprocessing run from the first delivery and suppress external side
//! effects.

use std::sync::Arc;
use taskflow_core::bus::EventBus;
use taskflow_core::environment::Clock;
use taskflow_core::event::{DomainEvent, EventMetadata};
use taskflow_core::event_store::{
    EventFolder, EventStore, EventStoreError, EventTypeCount, NewEvent, StoredEvent, fold_events,
};
use chrono::{DateTime, Utc};

/// Result of a replay run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Events re-emitted (or, on a dry run, counted).
    pub processed: usize,
    /// Events whose re-emission failed.
    pub errors: usize,
}

/// Operational surface over the event log.
pub struct EventStoreService {
    store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl EventStoreService {
    /// Create the service.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { store, bus, clock }
    }

    /// Append one event to an aggregate's history.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] on storage failure or version
    /// contention.
    pub async fn append(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        event_type: &str,
        event_data: serde_json::Value,
        metadata: EventMetadata,
    ) -> Result<StoredEvent, EventStoreError> {
        self.store
            .append_event(NewEvent {
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: aggregate_type.to_string(),
                event_type: event_type.to_string(),
                event_data,
                metadata,
                occurred_at: self.clock.now(),
            })
            .await
    }

    /// All events of one aggregate, ascending by version.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] on storage failure.
    pub async fn aggregate_events(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.aggregate_events(aggregate_id, aggregate_type).await
    }

    /// Rebuild an aggregate's current state by folding its history
    /// through `F`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] on storage failure.
    pub async fn rebuild_aggregate<F: EventFolder>(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<F::State, EventStoreError> {
        let events = self.store.aggregate_events(aggregate_id, aggregate_type).await?;
        Ok(fold_events::<F>(&events))
    }

    /// Events in `[start, end]` ordered by occurrence, optionally
    /// restricted to the given event types (operator surface).
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] on storage failure.
    pub async fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        event_types: Option<&[String]>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.events_in_range(start, end, event_types).await
    }

    /// Re-emit stored events over the bus for reprocessing.
    ///
    /// Events are emitted in `occurred_at` order, tagged as replays
    /// (handlers decide what to suppress). With `dry_run` the events are
    /// counted but nothing is emitted. Emission failures are counted and
    /// logged; the run continues.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] when the range query fails.
    pub async fn replay(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        event_types: Option<&[String]>,
        dry_run: bool,
    ) -> Result<ReplayReport, EventStoreError> {
        let events = self.store.events_in_range(start, end, event_types).await?;
        let total = events.len();

        tracing::info!(total, dry_run, "Replaying events");

        let mut report = ReplayReport::default();
        for stored in events {
            if dry_run {
                report.processed += 1;
                continue;
            }

            let event = DomainEvent::new(
                stored.event_type.clone(),
                stored.event_data.clone(),
                stored.metadata.clone(),
                stored.occurred_at,
            )
            .into_replay(stored.id, self.clock.now());

            match self.bus.publish(&event).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    report.errors += 1;
                    tracing::error!(
                        event_id = %stored.id,
                        event_type = %stored.event_type,
                        error = %err,
                        "Failed to replay event"
                    );
                },
            }

            if report.processed % 100 == 0 && report.processed > 0 {
                tracing::info!(processed = report.processed, total, "Replay progress");
            }
        }

        tracing::info!(
            processed = report.processed,
            errors = report.errors,
            dry_run,
            "Replay complete"
        );
        Ok(report)
    }

    /// Per-type, per-day event counts over the trailing `days`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] on storage failure.
    pub async fn stats(&self, days: i64) -> Result<Vec<EventTypeCount>, EventStoreError> {
        let since = self.clock.now() - chrono::Duration::days(days);
        self.store.type_counts_since(since).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    // Append/rebuild/replay behavior, including replay tagging, is covered
    // in tests/pipeline.rs against the in-memory event store and bus.
}
