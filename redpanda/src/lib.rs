//! Kafka-compatible broker transport for Taskflow.
//!
//! Implements the [`Broker`] trait from `taskflow-core` over rdkafka, so
//! the transport works against Redpanda, Apache Kafka, or any
//! Kafka-protocol service.
//!
//! # Topology
//!
//! All domain events travel one topic (default `taskflow.events`). The
//! routing key — the event type string — becomes the Kafka message key, so
//! events of the same type land in the same partition and keep their
//! relative order. Consumers join a consumer group on that topic; multiple
//! service instances share the partitions.
//!
//! # Delivery semantics
//!
//! At-least-once, with manual offset commits:
//! - offsets are committed only AFTER the message has been delivered into
//!   the subscriber's channel
//! - a crash before the commit means redelivery, which the inbox
//!   deduplicates by message id
//! - undecodable messages are surfaced as errors AND committed — they
//!   would never become decodable, and looping on them would wedge the
//!   partition
//!
//! # Wire format
//!
//! Message bodies are the JSON envelope [`BrokerMessage`]
//! (`{id, event_type, payload}`), readable by non-Rust consumers.
//!
//! # Example
//!
//! ```no_run
//! use taskflow_redpanda::RedpandaBroker;
//! use taskflow_core::broker::{Broker, BrokerMessage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("taskflow-consumer")
//!     .build()?;
//!
//! let message = BrokerMessage::new("task.created", serde_json::json!({"task_id": "t-1"}));
//! broker.publish("task.created", &message).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use taskflow_core::broker::{Broker, BrokerError, BrokerMessage, MessageStream};

/// Default topic carrying all Taskflow domain events.
pub const DEFAULT_TOPIC: &str = "taskflow.events";

/// Kafka-compatible [`Broker`] implementation.
pub struct RedpandaBroker {
    producer: FutureProducer,
    brokers: String,
    topic: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaBroker {
    /// Create a broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be
    /// created from the given broker addresses.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for configuring the broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// The topic this broker publishes to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The configured broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBrokerBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic to publish to (default: [`DEFAULT_TOPIC`]).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"`, or `"all"`
    /// (default: `"all"` — the outbox already absorbed the durability
    /// risk once; the broker hop should not reintroduce it).
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the producer send timeout (default: 5 seconds).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group id for subscriptions.
    ///
    /// Instances sharing a group id share the partition workload. Without
    /// an explicit group the subscriber derives one from the topic list.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the subscriber channel capacity (default: 1000).
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where new consumer groups start reading: `"earliest"` or
    /// `"latest"` (default: `"earliest"` — a fresh consumer must not skip
    /// events published before it joined).
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("all"))
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let broker = RedpandaBroker {
            producer,
            brokers,
            topic: self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
        };

        tracing::info!(
            brokers = %broker.brokers,
            topic = %broker.topic,
            buffer_size = broker.buffer_size,
            auto_offset_reset = %broker.auto_offset_reset,
            "RedpandaBroker created"
        );

        Ok(broker)
    }
}

impl Broker for RedpandaBroker {
    fn publish(
        &self,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let routing_key = routing_key.to_string();
        let message = message.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let body = serde_json::to_vec(&message).map_err(|e| BrokerError::PublishFailed {
                routing_key: routing_key.clone(),
                reason: format!("Failed to encode envelope: {e}"),
            })?;

            // Routing key as the partition key: same event type, same
            // partition, preserved relative order.
            let record = FutureRecord::to(&self.topic)
                .payload(&body)
                .key(routing_key.as_bytes());

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        routing_key = %routing_key,
                        partition,
                        offset,
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %self.topic,
                        routing_key = %routing_key,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(BrokerError::PublishFailed {
                        routing_key,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BrokerError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let group_id = consumer_group.unwrap_or_else(|| {
                let mut sorted = topics.clone();
                sorted.sort();
                format!("taskflow-{}", sorted.join("-"))
            });

            // Manual commits: the offset moves only after the message has
            // reached the subscriber's channel.
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BrokerError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BrokerError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group_id,
                "Subscribed to broker topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(received) = stream.next().await {
                    match received {
                        Ok(kafka_message) => {
                            let decoded = kafka_message.payload().map_or_else(
                                || {
                                    Err(BrokerError::DeserializationFailed(
                                        "Message has no payload".to_string(),
                                    ))
                                },
                                |payload| {
                                    serde_json::from_slice::<BrokerMessage>(payload).map_err(|e| {
                                        BrokerError::DeserializationFailed(format!(
                                            "Invalid envelope: {e}"
                                        ))
                                    })
                                },
                            );

                            let undecodable = decoded.is_err();
                            if tx.send(decoded).await.is_err() {
                                // Receiver dropped; exit WITHOUT committing so
                                // the message is redelivered elsewhere.
                                tracing::debug!("Subscriber dropped, consumer task exiting");
                                break;
                            }

                            // Commit only after the channel accepted the
                            // message. Undecodable messages are committed too:
                            // they will never decode and must not wedge the
                            // partition.
                            if let Err(e) =
                                consumer.commit_message(&kafka_message, CommitMode::Async)
                            {
                                tracing::warn!(
                                    topic = kafka_message.topic(),
                                    partition = kafka_message.partition(),
                                    offset = kafka_message.offset(),
                                    undecodable,
                                    error = %e,
                                    "Offset commit failed (message may be redelivered)"
                                );
                            }
                        },
                        Err(e) => {
                            let err = BrokerError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

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
