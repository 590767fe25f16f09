//! Vigil Pipeline - video frames to annotated detections over Kafka
//!
//! This library captures frames from live video streams, publishes them to
//! per-stream Kafka channels and, on the consuming side, batches them, runs
//! them through a model-serving endpoint, draws the detections and stores the
//! annotated frames in object storage. It handles:
//!
//! - Sampled frame capture with reconnection (`stream_reader`, `gst_source`)
//! - Ordered, bounded publishing that survives broker outages (`frame_publisher`)
//! - Size/time bounded batching with at-least-once offset commits
//!   (`batch_assembler`, `commit`, `channel_worker`)
//! - Inference, annotation and storage (`inference`, `annotator`, `storage`)
//! - Health, readiness and Prometheus metrics (`health`, `metrics`)
//!
//! # Example
//!
//! ```rust,no_run
//! use vigil_pipeline::{Mode, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     vigil_pipeline::orchestrator::run(config, Mode::Consumer, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

pub mod annotator;
pub mod batch_assembler;
pub mod channel_worker;
pub mod commit;
pub mod config;
pub mod consumer;
pub mod frame;
pub mod frame_publisher;
#[cfg(feature = "gstreamer")]
pub mod gst_source;
pub mod health;
pub mod inference;
pub mod metrics;
pub mod orchestrator;
pub mod producer;
pub mod retry;
pub mod storage;
pub mod stream_reader;

// Re-export main types
pub use annotator::{annotate, AnnotateError, AnnotateOptions};
pub use batch_assembler::{Batch, BatchAssembler, BatchEntry, BatchTrigger};
pub use channel_worker::{ChannelError, ChannelWorker, FailedBatchReport};
pub use commit::CommitCursor;
pub use config::{
    BatchPolicy, ConfigError, KafkaConfig, PipelineConfig, SampleRate, StorageBackend, StreamSource,
};
pub use consumer::{
    ChannelConsumer, ConsumerError, IncomingMessage, MessageMetadata, MessageSource, PartitionOffset,
};
pub use frame::{AnnotatedArtifact, DetectionBox, DetectionResult, Frame};
pub use frame_publisher::{FramePublisher, PublishAck, PublishError};
pub use health::{HealthReport, HealthState};
pub use inference::{Detector, HttpDetector, InferenceClient, InferenceError};
pub use metrics::{DropReason, PipelineMetrics};
pub use orchestrator::{Mode, Orchestrator};
pub use producer::{DeliveryResult, KafkaSink, MessageSink, OutgoingMessage, ProducerError};
pub use retry::RetryConfig;
pub use storage::{MemoryStore, ObjectStore, ResultPublisher, S3Store, StorageError};
pub use stream_reader::{FrameHandle, FrameSource, RawImage, StreamError, StreamReader};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::consumer::{IncomingMessage, MessageSource, PartitionOffset};
    pub use crate::frame::{DetectionResult, Frame};
    pub use crate::inference::Detector;
    pub use crate::producer::{MessageSink, OutgoingMessage};
    pub use crate::storage::ObjectStore;
    pub use crate::stream_reader::{FrameHandle, FrameSource};
    pub use async_trait::async_trait;
}
