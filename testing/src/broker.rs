//! In-memory broker for deterministic delivery tests.
//!
//! Publishes are recorded in an inspectable log and forwarded to every
//! live subscriber. Failure injection ([`InMemoryBroker::fail_next`])
//! scripts a number of consecutive publish failures, which is how tests
//! drive the outbox retry/exhaustion scenarios without a real broker
//! outage.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use taskflow_core::broker::{Broker, BrokerError, BrokerMessage, MessageStream};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct Subscriber {
    topics: Vec<String>,
    sender: mpsc::UnboundedSender<Result<BrokerMessage, BrokerError>>,
}

/// In-memory [`Broker`] implementation.
///
/// All messages are published to a single logical topic (like the
/// production transport's one event topic); the routing key is recorded
/// alongside each message for assertions.
pub struct InMemoryBroker {
    topic: String,
    published: Mutex<Vec<(String, BrokerMessage)>>,
    failures: Mutex<VecDeque<String>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl InMemoryBroker {
    /// Default topic name.
    pub const DEFAULT_TOPIC: &'static str = "taskflow.events";

    /// Create a broker with the default topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_topic(Self::DEFAULT_TOPIC)
    }

    /// Create a broker with a custom topic name.
    #[must_use]
    pub fn with_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            published: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Script the next `count` publishes to fail with `reason`.
    pub fn fail_next(&self, count: usize, reason: &str) {
        let mut failures = lock(&self.failures);
        for _ in 0..count {
            failures.push_back(reason.to_string());
        }
    }

    /// Snapshot of successful publishes as `(routing_key, message)` pairs.
    #[must_use]
    pub fn published(&self) -> Vec<(String, BrokerMessage)> {
        lock(&self.published).clone()
    }

    /// Number of successful publishes.
    #[must_use]
    pub fn published_count(&self) -> usize {
        lock(&self.published).len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for InMemoryBroker {
    fn publish(
        &self,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let routing_key = routing_key.to_string();
        let message = message.clone();

        Box::pin(async move {
            if let Some(reason) = lock(&self.failures).pop_front() {
                return Err(BrokerError::PublishFailed {
                    routing_key,
                    reason,
                });
            }

            lock(&self.published).push((routing_key, message.clone()));

            let mut subscribers = lock(&self.subscribers);
            subscribers.retain(|subscriber| {
                if !subscriber.topics.contains(&self.topic) {
                    return true;
                }
                // Drop subscribers whose receiver is gone.
                subscriber.sender.send(Ok(message.clone())).is_ok()
            });

            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BrokerError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();

        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&self.subscribers).push(Subscriber { topics, sender: tx });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use futures::StreamExt;

    fn message(event_type: &str) -> BrokerMessage {
        BrokerMessage::new(event_type, serde_json::json!({"k": "v"}))
    }

    #[tokio::test]
    async fn publish_records_and_forwards() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&[InMemoryBroker::DEFAULT_TOPIC]).await.unwrap();

        broker.publish("task.created", &message("task.created")).await.unwrap();

        assert_eq!(broker.published_count(), 1);
        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.event_type, "task.created");
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let broker = InMemoryBroker::new();
        broker.fail_next(2, "broker down");

        assert!(broker.publish("task.created", &message("task.created")).await.is_err());
        assert!(broker.publish("task.created", &message("task.created")).await.is_err());
        assert!(broker.publish("task.created", &message("task.created")).await.is_ok());

        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn subscriber_on_other_topic_sees_nothing() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&["other.topic"]).await.unwrap();

        broker.publish("task.created", &message("task.created")).await.unwrap();

        // The channel stays empty; a bounded poll confirms nothing arrived.
        let polled = tokio::time::timeout(std::time::Duration::from_millis(20), stream.next()).await;
        assert!(polled.is_err());
    }
}
