//! Prometheus metrics for the delivery subsystem.
//!
//! Components record through the `metrics` facade at their natural seams
//! (publishes, duplicates, escalations, saga outcomes, webhook delivery
//! durations); this module installs the Prometheus recorder, registers
//! descriptions, and renders the scrape text.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskflow_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Hand server.render() to the process's HTTP layer at /metrics.
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter.
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the recorder.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder and render handle.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will be scraped at `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or
    /// installed. A recorder already installed (tests) is tolerated with
    /// a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Render current metrics in Prometheus exposition format.
    ///
    /// Returns `None` before [`MetricsServer::start`].
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for every metric the components emit.
fn register_metrics() {
    // Event store
    describe_counter!(
        "taskflow.event_store.appended",
        "Events appended to the event store"
    );

    // Outbox
    describe_counter!(
        "taskflow.outbox.published",
        "Outbox messages published to the broker"
    );
    describe_counter!(
        "taskflow.outbox.publish_failures",
        "Outbox publish attempts that failed"
    );
    describe_gauge!(
        "taskflow.outbox.exhausted",
        "Unprocessed outbox messages at the retry ceiling"
    );

    // Inbox
    describe_counter!(
        "taskflow.inbox.processed",
        "Inbox messages processed successfully"
    );
    describe_counter!(
        "taskflow.inbox.duplicates",
        "Duplicate deliveries recognized and skipped"
    );
    describe_counter!(
        "taskflow.inbox.handler_failures",
        "Inbox handler invocations that failed"
    );

    // Consumer
    describe_counter!(
        "taskflow.consumer.stream_errors",
        "Errors received on the broker stream"
    );

    // Dead letter queue
    describe_counter!("taskflow.dlq.added", "Messages escalated to the DLQ");
    describe_counter!("taskflow.dlq.resolved", "Dead letters resolved");
    describe_counter!("taskflow.dlq.retried", "Dead letters retried successfully");
    describe_counter!(
        "taskflow.dlq.retry_failures",
        "Dead letter retries that failed"
    );

    // Sagas
    describe_counter!("taskflow.saga.completed", "Saga executions completed");
    describe_counter!(
        "taskflow.saga.compensated",
        "Saga executions that were compensated"
    );
    describe_counter!(
        "taskflow.saga.compensation_failures",
        "Individual compensation actions that failed"
    );

    // Webhooks
    describe_counter!("taskflow.webhook.delivered", "Webhook deliveries that succeeded");
    describe_counter!("taskflow.webhook.failed", "Webhook deliveries that failed");
    describe_histogram!(
        "taskflow.webhook.delivery_duration_seconds",
        "Webhook delivery round-trip time"
    );

    // Scheduler
    describe_counter!(
        "taskflow.scheduler.tick_errors",
        "Periodic task ticks that failed"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn render_is_none_before_start() {
        let server = MetricsServer::new("127.0.0.1:9090".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[test]
    fn register_is_idempotent() {
        register_metrics();
        register_metrics();
    }
}
