//! One channel's consume → batch → infer → annotate → store → commit loop.
//!
//! Offsets only move after every artifact of a batch is stored. A batch that
//! fails at any stage is reported, its partitions are rewound to the batch's
//! first offset and the channel pauses before consuming again, so the same
//! messages come back and overwrite the same keys.

use crate::annotator::{annotate, AnnotateError, AnnotateOptions};
use crate::batch_assembler::{Batch, BatchAssembler, BatchEntry};
use crate::commit::CommitCursor;
use crate::consumer::{ConsumerError, IncomingMessage, MessageSource};
use crate::frame::{AnnotatedArtifact, Frame};
use crate::frame_publisher::FRAME_MESSAGE_TYPE;
use crate::health::HealthState;
use crate::inference::{InferenceClient, InferenceError};
use crate::metrics::{DropReason, PipelineMetrics};
use crate::producer::{MessageSink, OutgoingMessage};
use crate::retry::RetryConfig;
use crate::storage::{ResultPublisher, StorageError};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Message type header of dead-letter reports
pub const FAILED_BATCH_MESSAGE_TYPE: &str = "failed_batch";

const POLL_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// How often an idle worker reports progress.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Why a batch could not be committed.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Annotation failed: {0}")]
    Annotate(#[from] AnnotateError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Offset commit failed: {0}")]
    Commit(#[from] ConsumerError),
}

impl ChannelError {
    /// Pipeline stage the batch failed in.
    pub fn stage(&self) -> &'static str {
        match self {
            ChannelError::Inference(_) => "inference",
            ChannelError::Annotate(_) => "annotate",
            ChannelError::Storage(_) => "storage",
            ChannelError::Commit(_) => "commit",
        }
    }
}

/// Offsets of one partition covered by a failed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub partition: i32,
    pub first: i64,
    pub last: i64,
}

/// Dead-letter record for a batch that failed processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatchReport {
    pub batch_id: Uuid,
    pub channel: String,
    pub stream_id: String,
    pub frame_numbers: Vec<u64>,
    pub offsets: Vec<PartitionRange>,
    pub stage: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedBatchReport {
    pub fn new(batch: &Batch, error: &ChannelError) -> Self {
        Self {
            batch_id: batch.id,
            channel: batch.channel.clone(),
            stream_id: batch.stream_id.clone(),
            frame_numbers: batch.frame_numbers(),
            offsets: batch
                .offsets
                .iter()
                .map(|(&partition, range)| PartitionRange {
                    partition,
                    first: range.first,
                    last: range.last,
                })
                .collect(),
            stage: error.stage().to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}

struct DeadLetter {
    sink: Arc<dyn MessageSink>,
    topic: String,
}

/// Drives one channel from its consumer to its bucket.
pub struct ChannelWorker {
    source: Box<dyn MessageSource>,
    assembler: BatchAssembler,
    inference: InferenceClient,
    results: ResultPublisher,
    annotate: AnnotateOptions,
    cursor: CommitCursor,
    dead_letter: Option<DeadLetter>,
    store_empty_frames: bool,
    failure_backoff: ExponentialBackoff,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthState>,
}

impl ChannelWorker {
    pub fn new(
        source: Box<dyn MessageSource>,
        assembler: BatchAssembler,
        inference: InferenceClient,
        results: ResultPublisher,
        metrics: Arc<PipelineMetrics>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            source,
            assembler,
            inference,
            results,
            annotate: AnnotateOptions::default(),
            cursor: CommitCursor::new(),
            dead_letter: None,
            store_empty_frames: true,
            failure_backoff: RetryConfig::new(0, 1000, 30000).backoff(),
            metrics,
            health,
        }
    }

    pub fn with_annotate_options(mut self, options: AnnotateOptions) -> Self {
        self.annotate = options;
        self
    }

    /// Publish a [`FailedBatchReport`] to `topic` for every failed batch.
    pub fn with_dead_letter(mut self, sink: Arc<dyn MessageSink>, topic: impl Into<String>) -> Self {
        self.dead_letter = Some(DeadLetter {
            sink,
            topic: topic.into(),
        });
        self
    }

    /// Whether frames without detections are written to storage.
    pub fn with_store_empty_frames(mut self, store: bool) -> Self {
        self.store_empty_frames = store;
        self
    }

    /// Pause schedule after failed batches.
    pub fn with_failure_backoff(mut self, policy: &RetryConfig) -> Self {
        self.failure_backoff = policy.backoff();
        self
    }

    pub fn channel(&self) -> &str {
        self.assembler.channel()
    }

    /// Consume until cancelled, then flush the accumulating batch.
    ///
    /// A batch being processed when `cancel` fires is finished first. Every
    /// pass through the loop, idle or not, counts as progress for liveness;
    /// a worker stuck inside a batch stops reporting it.
    pub async fn run(mut self, cancel: CancellationToken) {
        let channel = self.channel().to_string();
        info!(
            channel = %channel,
            stream_id = %self.assembler.stream_id(),
            bucket = %self.results.bucket(),
            max_size = self.assembler.policy().max_size,
            max_wait_ms = self.assembler.policy().max_wait.as_millis() as u64,
            "Starting channel worker"
        );

        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.health.worker_progress(&channel);
            let deadline = self.assembler.deadline();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(batch) = self.assembler.expire(Instant::now()) {
                        self.process(batch, &cancel).await;
                    }
                }
                message = self.source.recv() => match message {
                    Ok(message) => {
                        if let Some(batch) = self.accept(message) {
                            self.process(batch, &cancel).await;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Failed to receive message");
                        pause(POLL_ERROR_PAUSE, &cancel).await;
                    }
                },
                _ = progress.tick() => {}
            }
        }

        if let Some(batch) = self.assembler.drain() {
            info!(channel = %channel, frames = batch.len(), "Flushing partial batch on shutdown");
            self.process(batch, &cancel).await;
        }
        self.health.worker_stopped(&channel);
        info!(channel = %channel, "Channel worker stopped");
    }

    /// Fold one message into the accumulating batch.
    fn accept(&mut self, message: IncomingMessage) -> Option<Batch> {
        let channel = self.assembler.channel().to_string();
        let position = message.position();
        self.metrics.message_consumed(&channel);

        if let Some(kind) = message.message_type() {
            if kind != FRAME_MESSAGE_TYPE {
                let detail = format!("message type {}", kind);
                return self.skip(&message, "unexpected_type", detail);
            }
        }

        let frame = match Frame::from_payload(&message.payload) {
            Ok(frame) => frame,
            Err(e) => return self.skip(&message, "malformed", e.to_string()),
        };

        if frame.stream_id != self.assembler.stream_id() {
            let reason = format!("frame belongs to stream {}", frame.stream_id);
            return self.skip(&message, "foreign_stream", reason);
        }

        self.assembler.push(BatchEntry { frame, position }, Instant::now())
    }

    fn skip(&mut self, message: &IncomingMessage, reason: &'static str, detail: String) -> Option<Batch> {
        let channel = self.assembler.channel().to_string();
        warn!(
            channel = %channel,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            reason,
            detail = %detail,
            "Skipping message"
        );
        self.metrics.message_skipped(&channel, reason);
        self.assembler.skip(message.position());
        None
    }

    async fn process(&mut self, batch: Batch, cancel: &CancellationToken) {
        self.metrics
            .batch_dispatched(&batch.channel, batch.trigger.as_str());
        debug!(
            channel = %batch.channel,
            batch_id = %batch.id,
            frames = batch.len(),
            trigger = batch.trigger.as_str(),
            "Dispatching batch"
        );

        match self.dispatch(&batch).await {
            Ok(stored) => {
                self.failure_backoff.reset();
                self.metrics
                    .batch_committed(&batch.channel, batch.opened_at.elapsed());
                info!(
                    channel = %batch.channel,
                    batch_id = %batch.id,
                    frames = batch.len(),
                    stored,
                    "Batch committed"
                );
            }
            Err(e) => self.on_failure(batch, e, cancel).await,
        }
    }

    /// Run a batch through every stage. Returns how many artifacts were stored.
    async fn dispatch(&mut self, batch: &Batch) -> Result<usize, ChannelError> {
        let results = self.inference.infer(batch).await?;
        self.health.mark_inference_ok();

        let mut artifacts: Vec<AnnotatedArtifact> = Vec::with_capacity(batch.len());
        for (entry, result) in batch.entries.iter().zip(results.iter()) {
            if result.boxes.is_empty() && !self.store_empty_frames {
                continue;
            }

            match annotate(&entry.frame, result, &self.annotate) {
                Ok(artifact) => artifacts.push(artifact),
                Err(AnnotateError::Decode(reason)) => {
                    warn!(
                        stream_id = %entry.frame.stream_id,
                        frame_number = entry.frame.frame_number,
                        reason = %reason,
                        "Dropping undecodable frame"
                    );
                    self.metrics
                        .frame_dropped(&entry.frame.stream_id, DropReason::Undecodable);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !artifacts.is_empty() {
            self.results.store_batch(&artifacts).await?;
            self.health.mark_storage_ok();
        }

        let offsets = self.cursor.ahead(&batch.commit_offsets());
        self.source.commit(&offsets).await?;
        self.cursor.record(&offsets);

        Ok(artifacts.len())
    }

    async fn on_failure(&mut self, batch: Batch, failure: ChannelError, cancel: &CancellationToken) {
        let stage = failure.stage();
        self.metrics.batch_failed(&batch.channel, stage);

        let offsets: Vec<String> = batch
            .offsets
            .iter()
            .map(|(p, r)| format!("{}:{}-{}", p, r.first, r.last))
            .collect();
        error!(
            channel = %batch.channel,
            stream_id = %batch.stream_id,
            batch_id = %batch.id,
            stage,
            frame_numbers = ?batch.frame_numbers(),
            offsets = ?offsets,
            error = %failure,
            "Batch failed, offsets not committed"
        );

        if let Some(dead_letter) = &self.dead_letter {
            let report = FailedBatchReport::new(&batch, &failure);
            let sent = match OutgoingMessage::new_json(&dead_letter.topic, &report) {
                Ok(message) => {
                    dead_letter
                        .sink
                        .send(
                            message
                                .with_key(&batch.stream_id)
                                .with_message_type(FAILED_BATCH_MESSAGE_TYPE)
                                .with_correlation_id(batch.id.to_string()),
                        )
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(
                    batch_id = %batch.id,
                    topic = %dead_letter.topic,
                    error = %e,
                    "Failed to publish dead-letter report"
                );
            }
        }

        // Anything consumed after the batch is redelivered along with it.
        self.assembler.reset();
        if let Err(e) = self.source.rewind(&batch.rewind_positions()).await {
            error!(
                channel = %batch.channel,
                batch_id = %batch.id,
                error = %e,
                "Failed to rewind consumer; batch is redelivered after restart"
            );
        }

        if let Some(delay) = self.failure_backoff.next_backoff() {
            warn!(
                channel = %batch.channel,
                delay_ms = delay.as_millis() as u64,
                "Pausing channel after failed batch"
            );
            pause(delay, cancel).await;
        }
    }
}

/// Sleep unless cancelled first.
async fn pause(delay: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchPolicy, HealthConfig, StorageConfig};
    use crate::consumer::{MessageMetadata, PartitionOffset};
    use crate::frame::encode_jpeg;
    use crate::inference::{FrameDetections, MockDetector, PredictResponse, WireDetection};
    use crate::producer::{DeliveryResult, PendingDelivery, ProducerError, Rejected};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::FutureExt;
    use image::{Rgb, RgbImage};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    #[derive(Default)]
    struct Log {
        commits: Vec<Vec<PartitionOffset>>,
        rewinds: Vec<Vec<PartitionOffset>>,
    }

    struct QueueSource {
        queue: VecDeque<IncomingMessage>,
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl MessageSource for QueueSource {
        async fn recv(&mut self) -> Result<IncomingMessage, ConsumerError> {
            match self.queue.pop_front() {
                Some(message) => Ok(message),
                None => futures::future::pending().await,
            }
        }

        async fn commit(&mut self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
            self.log.lock().commits.push(offsets.to_vec());
            Ok(())
        }

        async fn rewind(&mut self, positions: &[PartitionOffset]) -> Result<(), ConsumerError> {
            self.log.lock().rewinds.push(positions.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        fn enqueue(&self, message: OutgoingMessage) -> Result<PendingDelivery, Rejected> {
            let result = DeliveryResult {
                topic: message.topic.clone(),
                partition: 0,
                offset: 0,
                key: message.key.clone(),
            };
            self.sent.lock().push(message);
            Ok(async move { Ok::<_, ProducerError>(result) }.boxed())
        }

        async fn probe(&self) -> Result<(), ProducerError> {
            Ok(())
        }

        fn flush(&self, _timeout: Duration) -> Result<(), ProducerError> {
            Ok(())
        }
    }

    fn frame(stream_id: &str, n: u64) -> Frame {
        let img = RgbImage::from_pixel(16, 16, Rgb([90, 90, 90]));
        Frame {
            stream_id: stream_id.to_string(),
            frame_number: n,
            captured_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            width: 16,
            height: 16,
            image_bytes: encode_jpeg(&img, 80).unwrap(),
        }
    }

    fn message(payload: Vec<u8>, offset: i64) -> IncomingMessage {
        let mut headers = HashMap::new();
        headers.insert("message-type".to_string(), FRAME_MESSAGE_TYPE.to_string());
        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: "frames-lobby".to_string(),
                partition: 0,
                offset,
                key: Some(b"lobby".to_vec()),
                timestamp: None,
                headers,
            },
        }
    }

    fn frame_message(stream_id: &str, n: u64, offset: i64) -> IncomingMessage {
        message(frame(stream_id, n).to_payload().unwrap(), offset)
    }

    /// One detection on even frames, none on odd ones.
    fn respond(batch: &Batch) -> PredictResponse {
        PredictResponse {
            stream_id: batch.stream_id.clone(),
            results: batch
                .frames()
                .map(|f| FrameDetections {
                    frame_number: f.frame_number,
                    detections: if f.frame_number % 2 == 0 {
                        vec![WireDetection {
                            x1: 1.0,
                            y1: 1.0,
                            x2: 8.0,
                            y2: 8.0,
                            confidence: 0.9,
                            class_id: 0,
                            class_name: "person".to_string(),
                        }]
                    } else {
                        vec![]
                    },
                    inference_time_ms: 1.0,
                })
                .collect(),
            total_frames: batch.len(),
            total_detections: 0,
            total_inference_time_ms: 1.0,
        }
    }

    struct Harness {
        log: Arc<Mutex<Log>>,
        store: Arc<MemoryStore>,
        metrics: Arc<PipelineMetrics>,
        health: Arc<HealthState>,
    }

    fn worker(
        messages: Vec<IncomingMessage>,
        detector: MockDetector,
        max_size: usize,
    ) -> (ChannelWorker, Harness) {
        let log = Arc::new(Mutex::new(Log::default()));
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let health = Arc::new(HealthState::new(&HealthConfig::default()));
        let storage_config = StorageConfig::default();

        let worker = ChannelWorker::new(
            Box::new(QueueSource {
                queue: messages.into(),
                log: log.clone(),
            }),
            BatchAssembler::new(
                "frames-lobby",
                "lobby",
                BatchPolicy {
                    max_size,
                    max_wait: Duration::from_secs(5),
                },
            ),
            InferenceClient::new(
                Arc::new(detector),
                RetryConfig::new(1, 10, 10),
                0.5,
                metrics.clone(),
            ),
            ResultPublisher::new(store.clone(), "lobby-bucket", &storage_config, metrics.clone()),
            metrics.clone(),
            health.clone(),
        )
        .with_failure_backoff(&RetryConfig::new(0, 100, 100).without_jitter());

        (
            worker,
            Harness {
                log,
                store,
                metrics,
                health,
            },
        )
    }

    async fn run_until_idle(worker: ChannelWorker) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_messages_commit_with_next_batch() {
        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .returning(|batch, _| Ok(respond(batch)));

        let messages = vec![
            message(b"not json".to_vec(), 0),
            frame_message("lobby", 0, 1),
            frame_message("garage", 5, 2),
            frame_message("lobby", 1, 3),
        ];
        let (worker, harness) = worker(messages, detector, 2);
        run_until_idle(worker).await;

        let log = harness.log.lock();
        assert_eq!(
            log.commits,
            vec![vec![PartitionOffset {
                partition: 0,
                offset: 4
            }]]
        );
        assert_eq!(harness.store.keys("lobby-bucket").len(), 2);

        let rendered = harness.metrics.render();
        assert!(rendered.contains("reason=\"malformed\""));
        assert!(rendered.contains("reason=\"foreign_stream\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_frames_not_stored_when_disabled() {
        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .returning(|batch, _| Ok(respond(batch)));

        let messages = (0..4).map(|n| frame_message("lobby", n, n as i64)).collect();
        let (worker, harness) = worker(messages, detector, 4);
        run_until_idle(worker.with_store_empty_frames(false)).await;

        assert_eq!(harness.store.keys("lobby-bucket").len(), 2);
        assert_eq!(
            harness.log.lock().commits,
            vec![vec![PartitionOffset {
                partition: 0,
                offset: 4
            }]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frame_dropped_batch_continues() {
        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .returning(|batch, _| Ok(respond(batch)));

        let mut broken = frame("lobby", 1);
        broken.image_bytes = b"garbage".to_vec();
        let messages = vec![
            frame_message("lobby", 0, 0),
            message(broken.to_payload().unwrap(), 1),
        ];
        let (worker, harness) = worker(messages, detector, 2);
        run_until_idle(worker).await;

        assert_eq!(harness.store.keys("lobby-bucket").len(), 1);
        assert_eq!(harness.log.lock().commits.len(), 1);
        assert!(harness.metrics.render().contains("reason=\"undecodable\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_reported_and_rewound() {
        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .returning(|_, _| Err(InferenceError::Rejected {
                status: 422,
                message: "bad frames".to_string(),
            }));

        let sink = Arc::new(RecordingSink::default());
        let messages = vec![frame_message("lobby", 0, 10), frame_message("lobby", 1, 11)];
        let (worker, harness) = worker(messages, detector, 2);
        run_until_idle(worker.with_dead_letter(sink.clone(), "frames-dlq")).await;

        let log = harness.log.lock();
        assert!(log.commits.is_empty());
        assert_eq!(
            log.rewinds,
            vec![vec![PartitionOffset {
                partition: 0,
                offset: 10
            }]]
        );
        assert_eq!(harness.store.write_count(), 0);

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "frames-dlq");
        let report: FailedBatchReport = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(report.stage, "inference");
        assert_eq!(report.frame_numbers, vec![0, 1]);
        assert_eq!(
            report.offsets,
            vec![PartitionRange {
                partition: 0,
                first: 10,
                last: 11
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_on_cancel() {
        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .returning(|batch, _| Ok(respond(batch)));

        let messages = vec![frame_message("lobby", 0, 0)];
        let (worker, harness) = worker(messages, detector, 25);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(harness.log.lock().commits.is_empty());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(harness.log.lock().commits.len(), 1);
        assert_eq!(harness.store.keys("lobby-bucket").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_stays_live() {
        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .returning(|batch, _| Ok(respond(batch)));

        let messages = vec![frame_message("lobby", 0, 0)];
        let (worker, harness) = worker(messages, detector, 1);
        let window = HealthConfig::default().liveness_window();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));

        // Idle on an empty topic well past the liveness window.
        tokio::time::sleep(window * 3).await;
        harness.health.tick();
        assert!(harness.health.is_live());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(harness.store.keys("lobby-bucket").len(), 1);

        tokio::time::sleep(window * 2).await;
        harness.health.tick();
        assert!(harness.health.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_worker_fails_liveness() {
        let (worker, harness) = worker(vec![], MockDetector::new(), 1);
        let window = HealthConfig::default().liveness_window();

        let task = tokio::spawn(worker.run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(window + Duration::from_secs(1)).await;
        harness.health.tick();
        assert!(!harness.health.is_live());
        assert_eq!(harness.health.stalled_workers(), vec!["frames-lobby".to_string()]);
    }
}
