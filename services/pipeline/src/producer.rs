//! Kafka producer wrapper.
//!
//! [`MessageSink`] is the seam the frame publisher and the dead-letter path
//! write through; [`KafkaSink`] is its rdkafka implementation.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during message production
#[derive(Error, Debug, Clone)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Local producer queue is full")]
    QueueFull,

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),

    #[error("Producer is not connected: {0}")]
    NotConnected(String),
}

/// Result of a successful message delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if provided)
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a message from an already-serialized payload
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self::new(topic, payload))
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a correlation ID header
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// Delivery report for a message that was accepted into the producer queue.
pub type PendingDelivery = BoxFuture<'static, Result<DeliveryResult, ProducerError>>;

/// A message the producer queue refused, returned to the caller untouched.
pub type Rejected = (ProducerError, OutgoingMessage);

/// Anything frames and reports can be produced to.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Hand `message` to the producer queue without waiting for the broker.
    ///
    /// An `Err` means the message never left this process and hands it back;
    /// the returned future resolves once the broker acknowledged (or refused) it.
    fn enqueue(&self, message: OutgoingMessage) -> Result<PendingDelivery, Rejected>;

    /// Check that the broker is reachable.
    async fn probe(&self) -> Result<(), ProducerError>;

    /// Block until queued messages are delivered or `timeout` passes.
    fn flush(&self, timeout: Duration) -> Result<(), ProducerError>;

    /// Send a message and wait for delivery confirmation
    async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        self.enqueue(message).map_err(|(e, _)| e)?.await
    }
}

/// rdkafka-backed [`MessageSink`].
pub struct KafkaSink {
    producer: FutureProducer,
    delivery_timeout: Duration,
    metadata_timeout: Duration,
}

impl KafkaSink {
    /// Create a new producer with the given configuration
    pub fn new(config: &KafkaConfig, delivery_timeout: Duration) -> Result<Self, ProducerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            delivery_timeout,
            metadata_timeout: config.request_timeout(),
        })
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    fn enqueue(&self, message: OutgoingMessage) -> Result<PendingDelivery, Rejected> {
        let OutgoingMessage {
            topic,
            key,
            payload,
            headers,
        } = message;

        let mut owned_headers = OwnedHeaders::new_with_capacity(headers.len());
        for (name, value) in &headers {
            owned_headers = owned_headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&topic)
            .payload(&payload)
            .headers(owned_headers);
        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(
            "Sending message to topic {} (size: {} bytes)",
            topic,
            payload.len()
        );

        let sent = self.producer.send_result(record).map_err(|(e, _)| e);
        let delivery = match sent {
            Ok(delivery) => delivery,
            Err(e) => {
                let error = match e {
                    KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => {
                        ProducerError::QueueFull
                    }
                    other => ProducerError::SendError {
                        topic: topic.clone(),
                        message: other.to_string(),
                    },
                };
                let message = OutgoingMessage {
                    topic,
                    key,
                    payload,
                    headers,
                };
                return Err((error, message));
            }
        };

        let timeout = self.delivery_timeout;
        Ok(async move {
            let outcome = tokio::time::timeout(timeout, delivery)
                .await
                .map_err(|_| ProducerError::Timeout(timeout))?
                .map_err(|_| ProducerError::SendError {
                    topic: topic.clone(),
                    message: "delivery report dropped".to_string(),
                })?;

            let (partition, offset) = outcome.map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

            debug!(
                "Message delivered to partition {} at offset {}",
                partition, offset
            );

            Ok(DeliveryResult {
                topic,
                partition,
                offset,
                key,
            })
        }
        .boxed())
    }

    #[instrument(skip(self))]
    async fn probe(&self) -> Result<(), ProducerError> {
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;

        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|_| ())
                .map_err(|e| ProducerError::NotConnected(e.to_string()))
        })
        .await
        .map_err(|e| ProducerError::NotConnected(e.to_string()))?
    }

    fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for KafkaSink {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
