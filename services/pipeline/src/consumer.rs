//! Kafka consumer wrapper.
//!
//! Channel workers read through the [`MessageSource`] trait; offsets are only
//! ever committed explicitly, and a failed batch is redelivered by seeking
//! its partitions back.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Failed to seek: {0}")]
    SeekError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Timestamp of the message
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Get the message type header
    pub fn message_type(&self) -> Option<&str> {
        self.header("message-type")
    }

    /// Where this message sits in its topic
    pub fn position(&self) -> PartitionOffset {
        PartitionOffset {
            partition: self.metadata.partition,
            offset: self.metadata.offset,
        }
    }
}

/// A partition and an offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionOffset {
    pub partition: i32,
    pub offset: i64,
}

/// One channel's inbound message stream.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next message.
    async fn recv(&mut self) -> Result<IncomingMessage, ConsumerError>;

    /// Durably commit the given next-to-read offsets.
    async fn commit(&mut self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError>;

    /// Reposition partitions so the given offsets are delivered again.
    async fn rewind(&mut self, positions: &[PartitionOffset]) -> Result<(), ConsumerError>;
}

/// rdkafka-backed [`MessageSource`] subscribed to a single channel topic.
pub struct ChannelConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
    timeout: Duration,
}

impl ChannelConsumer {
    /// Create a consumer for `topic` and subscribe to it
    pub fn new(config: &KafkaConfig, topic: impl Into<String>) -> Result<Self, ConsumerError> {
        let topic = topic.into();
        info!(
            "Creating Kafka consumer for {} with group {}",
            config.bootstrap_servers, config.consumer.group_id
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        info!("Subscribing to topic: {}", topic);
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic,
            timeout: config.request_timeout(),
        })
    }

    fn partition_list(&self, offsets: &[PartitionOffset]) -> Result<TopicPartitionList, ConsumerError> {
        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for po in offsets {
            tpl.add_partition_offset(&self.topic, po.partition, Offset::Offset(po.offset))
                .map_err(|e| ConsumerError::CommitError(e.to_string()))?;
        }
        Ok(tpl)
    }
}

#[async_trait]
impl MessageSource for ChannelConsumer {
    async fn recv(&mut self) -> Result<IncomingMessage, ConsumerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| ConsumerError::PollError(e.to_string()))?;
        let incoming = convert_message(&message);

        debug!(
            "Received message from topic={}, partition={}, offset={}",
            incoming.metadata.topic, incoming.metadata.partition, incoming.metadata.offset
        );
        Ok(incoming)
    }

    #[instrument(skip(self), fields(topic = %self.topic))]
    async fn commit(&mut self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let tpl = self.partition_list(offsets)?;
        let consumer = self.consumer.clone();

        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }

    #[instrument(skip(self), fields(topic = %self.topic))]
    async fn rewind(&mut self, positions: &[PartitionOffset]) -> Result<(), ConsumerError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let positions = positions.to_vec();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            for po in positions {
                consumer
                    .seek(&topic, po.partition, Offset::Offset(po.offset), timeout)
                    .map_err(|e| ConsumerError::SeekError(e.to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ConsumerError::SeekError(e.to_string()))?
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}
