//! Pipeline counters.
//!
//! The recorder is owned by [`PipelineMetrics`] and handed to components as
//! an `Arc`, never installed as the process-global recorder. Two pipelines in
//! one process (as in the scenario tests) therefore never share counts.

use metrics::{Counter, Histogram, Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::time::Duration;

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

pub const FRAMES_CAPTURED: &str = "vigil_frames_captured_total";
pub const FRAMES_PUBLISHED: &str = "vigil_frames_published_total";
pub const FRAMES_DROPPED: &str = "vigil_frames_dropped_total";
pub const DECODE_ERRORS: &str = "vigil_decode_errors_total";
pub const SOURCE_RECONNECTS: &str = "vigil_source_reconnects_total";
pub const MESSAGES_CONSUMED: &str = "vigil_messages_consumed_total";
pub const MESSAGES_SKIPPED: &str = "vigil_messages_skipped_total";
pub const BATCHES_DISPATCHED: &str = "vigil_batches_dispatched_total";
pub const BATCHES_COMMITTED: &str = "vigil_batches_committed_total";
pub const BATCHES_FAILED: &str = "vigil_batches_failed_total";
pub const ARTIFACTS_STORED: &str = "vigil_artifacts_stored_total";
pub const RETRIES: &str = "vigil_retries_total";
pub const BATCH_DURATION: &str = "vigil_batch_duration_seconds";

/// Why a frame never reached the broker or storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Could not be serialized or exceeded the broker's size limit
    Serialization,
    /// Outage backlog was full
    Outage,
    /// Broker reported the delivery as failed
    Delivery,
    /// Stored frame could not be decoded for annotation
    Undecodable,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Serialization => "serialization",
            DropReason::Outage => "outage",
            DropReason::Delivery => "delivery",
            DropReason::Undecodable => "undecodable",
        }
    }
}

/// Process-wide pipeline metrics.
pub struct PipelineMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        Self { recorder, handle }
    }

    fn counter(&self, name: &'static str, labels: &[(&'static str, &str)]) -> Counter {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(*k, v.to_string()))
            .collect();
        self.recorder
            .register_counter(&Key::from_parts(name, labels), &METADATA)
    }

    fn histogram(&self, name: &'static str, labels: &[(&'static str, &str)]) -> Histogram {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(*k, v.to_string()))
            .collect();
        self.recorder
            .register_histogram(&Key::from_parts(name, labels), &METADATA)
    }

    pub fn frame_captured(&self, stream_id: &str) {
        self.counter(FRAMES_CAPTURED, &[("stream_id", stream_id)])
            .increment(1);
    }

    pub fn frame_published(&self, stream_id: &str) {
        self.counter(FRAMES_PUBLISHED, &[("stream_id", stream_id)])
            .increment(1);
    }

    pub fn frame_dropped(&self, stream_id: &str, reason: DropReason) {
        self.counter(
            FRAMES_DROPPED,
            &[("stream_id", stream_id), ("reason", reason.as_str())],
        )
        .increment(1);
    }

    pub fn decode_error(&self, stream_id: &str) {
        self.counter(DECODE_ERRORS, &[("stream_id", stream_id)])
            .increment(1);
    }

    pub fn source_reconnect(&self, stream_id: &str) {
        self.counter(SOURCE_RECONNECTS, &[("stream_id", stream_id)])
            .increment(1);
    }

    pub fn message_consumed(&self, channel: &str) {
        self.counter(MESSAGES_CONSUMED, &[("channel", channel)])
            .increment(1);
    }

    /// A broker message that could not become part of a batch.
    pub fn message_skipped(&self, channel: &str, reason: &'static str) {
        self.counter(MESSAGES_SKIPPED, &[("channel", channel), ("reason", reason)])
            .increment(1);
    }

    pub fn batch_dispatched(&self, channel: &str, trigger: &'static str) {
        self.counter(
            BATCHES_DISPATCHED,
            &[("channel", channel), ("trigger", trigger)],
        )
        .increment(1);
    }

    pub fn batch_committed(&self, channel: &str, elapsed: Duration) {
        self.counter(BATCHES_COMMITTED, &[("channel", channel)])
            .increment(1);
        self.histogram(BATCH_DURATION, &[("channel", channel)])
            .record(elapsed.as_secs_f64());
    }

    pub fn batch_failed(&self, channel: &str, stage: &'static str) {
        self.counter(BATCHES_FAILED, &[("channel", channel), ("stage", stage)])
            .increment(1);
    }

    pub fn artifact_stored(&self, stream_id: &str) {
        self.counter(ARTIFACTS_STORED, &[("stream_id", stream_id)])
            .increment(1);
    }

    pub fn retry(&self, dependency: &'static str) {
        self.counter(RETRIES, &[("dependency", dependency)])
            .increment(1);
    }

    /// Prometheus text exposition of every metric recorded so far.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = PipelineMetrics::new();
        metrics.frame_dropped("lobby", DropReason::Outage);
        metrics.frame_dropped("lobby", DropReason::Outage);
        metrics.batch_failed("frames-lobby", "inference");

        let rendered = metrics.render();
        assert!(rendered.contains(FRAMES_DROPPED));
        assert!(rendered.contains("reason=\"outage\""));
        assert!(rendered.contains(BATCHES_FAILED));
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = PipelineMetrics::new();
        let b = PipelineMetrics::new();
        a.frame_captured("lobby");

        assert!(a.render().contains(FRAMES_CAPTURED));
        assert!(!b.render().contains(FRAMES_CAPTURED));
    }
}
