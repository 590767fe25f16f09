//! Batched object detection over HTTP.
//!
//! One `POST {endpoint}/predict` per batch. [`Detector`] is the raw call,
//! [`InferenceClient`] adds retries, response validation and confidence
//! filtering on top.

use crate::batch_assembler::Batch;
use crate::config::InferenceConfig;
use crate::frame::{base64_serde, DetectionBox, DetectionResult};
use crate::metrics::PipelineMetrics;
use crate::retry::{retry_until_cancelled, RetryConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Inference endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Inference request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed inference response: {0}")]
    Protocol(String),

    #[error("Inference request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl InferenceError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InferenceError::Unavailable(_) | InferenceError::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Unavailable(_) => "unavailable",
            InferenceError::Timeout(_) => "timeout",
            InferenceError::Protocol(_) => "protocol",
            InferenceError::Rejected { .. } => "rejected",
        }
    }
}

/// `/predict` request body.
#[derive(Debug, Serialize)]
pub struct PredictRequest<'a> {
    pub stream_id: &'a str,
    pub confidence_threshold: f32,
    pub frames: Vec<PredictFrame<'a>>,
}

#[derive(Debug, Serialize)]
pub struct PredictFrame<'a> {
    pub frame_number: u64,
    #[serde(serialize_with = "base64_serde::serialize")]
    pub frame_data: &'a [u8],
    pub timestamp: DateTime<Utc>,
}

impl<'a> PredictRequest<'a> {
    pub fn from_batch(batch: &'a Batch, confidence_threshold: f32) -> Self {
        Self {
            stream_id: &batch.stream_id,
            confidence_threshold,
            frames: batch
                .frames()
                .map(|f| PredictFrame {
                    frame_number: f.frame_number,
                    frame_data: &f.image_bytes,
                    timestamp: f.captured_at,
                })
                .collect(),
        }
    }
}

/// `/predict` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    #[serde(default)]
    pub stream_id: String,
    pub results: Vec<FrameDetections>,
    #[serde(default)]
    pub total_frames: usize,
    #[serde(default)]
    pub total_detections: usize,
    #[serde(default)]
    pub total_inference_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    pub frame_number: u64,
    pub detections: Vec<WireDetection>,
    #[serde(default)]
    pub inference_time_ms: f64,
}

/// A detection as the endpoint reports it: corner coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    #[serde(default)]
    pub class_id: i64,
    pub class_name: String,
}

/// A model-serving endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Detector: Send + Sync {
    /// Run detection on every frame of `batch`, in order.
    async fn detect(
        &self,
        batch: &Batch,
        confidence_threshold: f32,
    ) -> Result<PredictResponse, InferenceError>;

    /// Liveness and readiness of the endpoint.
    async fn probe(&self) -> Result<(), InferenceError>;
}

/// reqwest-backed [`Detector`].
pub struct HttpDetector {
    client: Client,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpDetector {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| InferenceError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn transport_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout(self.request_timeout)
        } else if e.is_decode() {
            InferenceError::Protocol(e.to_string())
        } else {
            InferenceError::Unavailable(e.to_string())
        }
    }

    async fn get_ok(&self, path: &str) -> Result<(), InferenceError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(InferenceError::Unavailable(format!(
                "GET {} returned {}",
                path,
                response.status()
            )))
        }
    }
}

const MAX_ERROR_BODY: usize = 512;

fn truncate_at_char_boundary(message: &mut String, max_len: usize) {
    if message.len() <= max_len {
        return;
    }
    let mut end = max_len;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
}

/// Map a non-success status onto the error taxonomy.
fn status_error(status: StatusCode, body: String) -> InferenceError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        InferenceError::Unavailable(format!("status {}", status))
    } else {
        let mut message = body;
        truncate_at_char_boundary(&mut message, MAX_ERROR_BODY);
        InferenceError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    #[instrument(skip(self, batch), fields(stream_id = %batch.stream_id, batch_id = %batch.id, frames = batch.len()))]
    async fn detect(
        &self,
        batch: &Batch,
        confidence_threshold: f32,
    ) -> Result<PredictResponse, InferenceError> {
        let request = PredictRequest::from_batch(batch, confidence_threshold);

        let response = self
            .client
            .post(self.url("/predict"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        response
            .json::<PredictResponse>()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn probe(&self) -> Result<(), InferenceError> {
        self.get_ok("/health").await?;
        self.get_ok("/ready").await
    }
}

/// Retrying, validating front of a [`Detector`].
pub struct InferenceClient {
    detector: Arc<dyn Detector>,
    retry: RetryConfig,
    confidence_threshold: f32,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
}

impl InferenceClient {
    pub fn new(
        detector: Arc<dyn Detector>,
        retry: RetryConfig,
        confidence_threshold: f32,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            detector,
            retry,
            confidence_threshold,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop retrying once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn detector(&self) -> &Arc<dyn Detector> {
        &self.detector
    }

    /// Detections for every frame of `batch`, index-aligned with its entries.
    pub async fn infer(&self, batch: &Batch) -> Result<Vec<DetectionResult>, InferenceError> {
        let threshold = self.confidence_threshold;
        let response = retry_until_cancelled(
            &self.retry,
            "inference",
            |e: &InferenceError| {
                let retry = e.is_retryable();
                if retry {
                    self.metrics.retry("inference");
                }
                retry
            },
            &self.shutdown,
            || self.detector.detect(batch, threshold),
        )
        .await?;

        info!(
            stream_id = %batch.stream_id,
            batch_id = %batch.id,
            frames = response.results.len(),
            detections = response.total_detections,
            inference_ms = response.total_inference_time_ms,
            "Batch inference completed"
        );

        to_results(batch, response, threshold)
    }
}

/// Check `response` against `batch` and convert it. Results must line up
/// one-to-one, in order, with the batch's frames.
pub fn to_results(
    batch: &Batch,
    response: PredictResponse,
    confidence_threshold: f32,
) -> Result<Vec<DetectionResult>, InferenceError> {
    if !response.stream_id.is_empty() && response.stream_id != batch.stream_id {
        return Err(InferenceError::Protocol(format!(
            "response for stream {} while batch is for {}",
            response.stream_id, batch.stream_id
        )));
    }

    if response.results.len() != batch.len() {
        return Err(InferenceError::Protocol(format!(
            "expected {} results, got {}",
            batch.len(),
            response.results.len()
        )));
    }

    batch
        .frames()
        .zip(response.results)
        .enumerate()
        .map(|(index, (frame, result))| {
            if result.frame_number != frame.frame_number {
                return Err(InferenceError::Protocol(format!(
                    "result {} is for frame {}, expected frame {}",
                    index, result.frame_number, frame.frame_number
                )));
            }

            let total = result.detections.len();
            let boxes: Vec<DetectionBox> = result
                .detections
                .into_iter()
                .filter(|d| d.confidence.is_finite() && d.confidence >= confidence_threshold)
                .map(|d| DetectionBox::from_corners(d.class_name, d.confidence, d.x1, d.y1, d.x2, d.y2))
                .collect();

            if boxes.len() < total {
                debug!(
                    frame_number = frame.frame_number,
                    discarded = total - boxes.len(),
                    "Discarded low-confidence detections"
                );
            }

            Ok(DetectionResult {
                frame_number: frame.frame_number,
                boxes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_assembler::{BatchEntry, BatchTrigger};
    use crate::consumer::PartitionOffset;
    use crate::frame::Frame;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::BTreeMap;

    fn batch(frame_numbers: &[u64]) -> Batch {
        Batch {
            id: uuid::Uuid::new_v4(),
            channel: "frames-lobby".to_string(),
            stream_id: "lobby".to_string(),
            entries: frame_numbers
                .iter()
                .enumerate()
                .map(|(i, &n)| BatchEntry {
                    frame: Frame {
                        stream_id: "lobby".to_string(),
                        frame_number: n,
                        captured_at: Utc::now(),
                        width: 8,
                        height: 8,
                        image_bytes: vec![1, 2, 3],
                    },
                    position: PartitionOffset {
                        partition: 0,
                        offset: i as i64,
                    },
                })
                .collect(),
            offsets: BTreeMap::new(),
            trigger: BatchTrigger::Size,
            opened_at: tokio::time::Instant::now(),
        }
    }

    fn detection(confidence: f32) -> WireDetection {
        WireDetection {
            x1: 1.0,
            y1: 2.0,
            x2: 5.0,
            y2: 6.0,
            confidence,
            class_id: 0,
            class_name: "person".to_string(),
        }
    }

    fn response(frame_numbers: &[u64]) -> PredictResponse {
        PredictResponse {
            stream_id: "lobby".to_string(),
            results: frame_numbers
                .iter()
                .map(|&n| FrameDetections {
                    frame_number: n,
                    detections: vec![detection(0.9), detection(0.2)],
                    inference_time_ms: 3.0,
                })
                .collect(),
            total_frames: frame_numbers.len(),
            total_detections: frame_numbers.len() * 2,
            total_inference_time_ms: 10.0,
        }
    }

    fn client(detector: MockDetector) -> InferenceClient {
        InferenceClient::new(
            Arc::new(detector),
            RetryConfig::new(3, 1, 5).without_jitter(),
            0.5,
            Arc::new(PipelineMetrics::new()),
        )
    }

    #[test]
    fn test_results_filtered_and_converted() {
        let results = to_results(&batch(&[4, 5]), response(&[4, 5]), 0.5).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[1].frame_number, 5);
        assert_eq!(results[0].boxes.len(), 1);
        let b = &results[0].boxes[0];
        assert_eq!((b.x, b.y, b.w, b.h), (1.0, 2.0, 4.0, 4.0));
        assert_eq!(b.label, "person");
    }

    #[test]
    fn test_length_mismatch_is_protocol_error() {
        let err = to_results(&batch(&[1, 2, 3]), response(&[1, 2]), 0.5).unwrap_err();
        assert!(matches!(err, InferenceError::Protocol(_)));
    }

    #[test]
    fn test_frame_number_mismatch_is_protocol_error() {
        let err = to_results(&batch(&[1, 2]), response(&[2, 1]), 0.5).unwrap_err();
        assert!(matches!(err, InferenceError::Protocol(_)));
    }

    #[test]
    fn test_request_wire_format() {
        let batch = batch(&[9]);
        let request = PredictRequest::from_batch(&batch, 0.25);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["stream_id"], "lobby");
        assert_eq!(value["confidence_threshold"], 0.25);
        assert_eq!(value["frames"][0]["frame_number"], 9);
        assert_eq!(value["frames"][0]["frame_data"], "AQID");
    }

    #[tokio::test]
    async fn test_unavailable_is_retried() {
        let mut detector = MockDetector::new();
        let mut calls = 0;
        detector.expect_detect().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(InferenceError::Unavailable("status 503".to_string()))
            } else {
                Ok(response(&[0, 1]))
            }
        });

        let results = client(detector).infer(&batch(&[0, 1])).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .times(3)
            .returning(|_, _| Err(InferenceError::Timeout(Duration::from_secs(30))));

        let err = client(detector).infer(&batch(&[0])).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_rejected_and_protocol_are_not_retried() {
        let mut detector = MockDetector::new();
        detector.expect_detect().times(1).returning(|_, _| {
            Err(InferenceError::Rejected {
                status: 400,
                message: "bad batch".to_string(),
            })
        });
        let err = client(detector).infer(&batch(&[0])).await.unwrap_err();
        assert_eq!(err.kind(), "rejected");

        let mut detector = MockDetector::new();
        detector
            .expect_detect()
            .times(1)
            .returning(|_, _| Ok(response(&[0])));
        let err = client(detector).infer(&batch(&[0, 1])).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn http_detector(endpoint: String) -> HttpDetector {
        HttpDetector::new(&InferenceConfig {
            endpoint,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_detector_round_trip() {
        let router = Router::new()
            .route(
                "/predict",
                post(|Json(body): Json<serde_json::Value>| async move {
                    let n = body["frames"][0]["frame_number"].as_u64().unwrap();
                    Json(response(&[n]))
                }),
            )
            .route("/health", get(|| async { "ok" }))
            .route("/ready", get(|| async { "ok" }));
        let detector = http_detector(serve(router).await);

        let response = detector.detect(&batch(&[17]), 0.5).await.unwrap();
        assert_eq!(response.results[0].frame_number, 17);
        assert!(detector.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_http_detector_status_mapping() {
        let router = Router::new()
            .route(
                "/predict",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["frames"].as_array().map_or(0, |f| f.len()) > 1 {
                        (HttpStatus::BAD_REQUEST, "Batch size exceeds maximum")
                    } else {
                        (HttpStatus::SERVICE_UNAVAILABLE, "loading")
                    }
                }),
            )
            .route("/health", get(|| async { "ok" }))
            .route("/ready", get(|| async { (HttpStatus::SERVICE_UNAVAILABLE, "Model not ready") }));
        let detector = http_detector(serve(router).await);

        let err = detector.detect(&batch(&[0]), 0.5).await.unwrap_err();
        assert!(matches!(err, InferenceError::Unavailable(_)));

        let err = detector.detect(&batch(&[0, 1]), 0.5).await.unwrap_err();
        assert_eq!(
            err,
            InferenceError::Rejected {
                status: 400,
                message: "Batch size exceeds maximum".to_string()
            }
        );

        assert!(detector.probe().await.is_err());
    }

    #[test]
    fn test_rejected_body_truncated_on_char_boundary() {
        // 'é' is two bytes, so byte 512 falls inside a character
        let body = format!("x{}", "é".repeat(300));
        let err = status_error(StatusCode::UNPROCESSABLE_ENTITY, body);

        match err {
            InferenceError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message.len(), 511);
                assert!(message.ends_with('é'));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let detector = http_detector("http://127.0.0.1:1".to_string());
        let err = detector.probe().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
