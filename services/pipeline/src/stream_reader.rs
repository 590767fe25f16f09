//! Pull-based stream reader with sampling and automatic reconnection.
//!
//! A [`FrameSource`] opens a URI and yields decoded RGB images on demand.
//! [`StreamReader`] samples those images, JPEG-encodes the kept ones and
//! numbers them. [`run_capture`] drives a reader forever, reopening the
//! source with capped backoff and pushing frames into a bounded channel so a
//! slow publisher slows capture down instead of growing memory.

use crate::config::{CaptureConfig, SampleRate};
use crate::frame::{encode_jpeg, Frame};
use crate::metrics::PipelineMetrics;
use backoff::backoff::Backoff;
use chrono::Utc;
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can occur while reading a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream connection failed: {0}")]
    Connection(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Frame decode failed: {0}")]
    Decode(String),

    #[error("Capture worker failed: {0}")]
    Worker(String),
}

/// A decoded frame as packed RGB8 pixels.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Opens video sources. Implementations may block.
pub trait FrameSource: Send + Sync + 'static {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameHandle>, StreamError>;
}

/// An open video source.
pub trait FrameHandle: Send + 'static {
    /// Block until the next decoded frame is available. Returns
    /// [`StreamError::Connection`] when nothing arrives within `stall_timeout`.
    fn next_frame(&mut self, stall_timeout: Duration) -> Result<RawImage, StreamError>;
}

/// Decides which decoded frames are kept.
#[derive(Debug)]
pub struct Sampler {
    rate: SampleRate,
    seen: u64,
    last_kept: Option<Instant>,
}

impl Sampler {
    pub fn new(rate: SampleRate) -> Self {
        Self {
            rate,
            seen: 0,
            last_kept: None,
        }
    }

    /// Whether a frame decoded at `now` should be kept.
    pub fn should_keep(&mut self, now: Instant) -> bool {
        let index = self.seen;
        self.seen += 1;

        match self.rate {
            SampleRate::EveryNth(n) => index % u64::from(n.max(1)) == 0,
            SampleRate::Fps(fps) => {
                let interval = Duration::from_secs_f64(1.0 / f64::from(fps));
                match self.last_kept {
                    Some(last) if now.saturating_duration_since(last) < interval => false,
                    _ => {
                        self.last_kept = Some(now);
                        true
                    }
                }
            }
        }
    }
}

/// Reads, samples and encodes frames from one source.
pub struct StreamReader {
    stream_id: String,
    uri: String,
    source: Arc<dyn FrameSource>,
    handle: Option<Box<dyn FrameHandle>>,
    sampler: Sampler,
    next_frame_number: u64,
    jpeg_quality: u8,
    stall_timeout: Duration,
}

impl StreamReader {
    pub fn new(
        stream_id: impl Into<String>,
        uri: impl Into<String>,
        source: Arc<dyn FrameSource>,
        sample_rate: SampleRate,
        capture: &CaptureConfig,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            uri: uri.into(),
            source,
            handle: None,
            sampler: Sampler::new(sample_rate),
            next_frame_number: 0,
            jpeg_quality: capture.jpeg_quality,
            stall_timeout: capture.stall_timeout(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Open (or reopen) the underlying source.
    pub fn open(&mut self) -> Result<(), StreamError> {
        self.handle = None;
        self.handle = Some(self.source.open(&self.uri)?);
        Ok(())
    }

    /// Release the underlying source. Frame numbering continues on reopen.
    pub fn close(&mut self) {
        self.handle = None;
    }

    /// Block until the next sampled frame.
    pub fn next_frame(&mut self) -> Result<Frame, StreamError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| StreamError::Connection("stream is not open".to_string()))?;

        loop {
            let raw = handle.next_frame(self.stall_timeout)?;
            if !self.sampler.should_keep(Instant::now()) {
                continue;
            }

            let (width, height) = (raw.width, raw.height);
            let image = RgbImage::from_raw(width, height, raw.pixels).ok_or_else(|| {
                StreamError::Decode(format!(
                    "buffer does not hold a {}x{} RGB image",
                    width, height
                ))
            })?;
            let image_bytes = encode_jpeg(&image, self.jpeg_quality)
                .map_err(|e| StreamError::Decode(e.to_string()))?;

            let frame_number = self.next_frame_number;
            self.next_frame_number += 1;

            return Ok(Frame {
                stream_id: self.stream_id.clone(),
                frame_number,
                captured_at: Utc::now(),
                width,
                height,
                image_bytes,
            });
        }
    }
}

/// Run a blocking reader call on the blocking pool, handing the reader back.
async fn on_blocking_pool<T, F>(
    mut reader: StreamReader,
    call: F,
) -> Result<(StreamReader, T), StreamError>
where
    T: Send + 'static,
    F: FnOnce(&mut StreamReader) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = call(&mut reader);
        (reader, result)
    })
    .await
    .map_err(|e| StreamError::Worker(e.to_string()))
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Capture frames from `reader` into `frames` until cancelled, the receiver
/// goes away, or (with `stop_on_end_of_stream`) the source ends.
pub async fn run_capture(
    mut reader: StreamReader,
    frames: mpsc::Sender<Frame>,
    capture: CaptureConfig,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) -> Result<(), StreamError> {
    let stream_id = reader.stream_id().to_string();
    let mut backoff = capture.reconnect.backoff();
    let mut failed_opens = 0u32;
    let mut decode_errors = 0u32;

    info!(stream_id = %stream_id, "Starting capture loop");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if !reader.is_open() {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                result = on_blocking_pool(reader, |r| r.open()) => result?,
            };
            reader = opened.0;

            match opened.1 {
                Ok(()) => {
                    info!(stream_id = %stream_id, attempts = failed_opens, "Connected to stream");
                    failed_opens = 0;
                }
                Err(e) => {
                    failed_opens += 1;
                    metrics.source_reconnect(&stream_id);

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| capture.reconnect.max_backoff());
                    warn!(
                        stream_id = %stream_id,
                        attempt = failed_opens,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    if !pause(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            }
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            result = on_blocking_pool(reader, |r| r.next_frame()) => result?,
        };
        reader = read.0;

        match read.1 {
            Ok(frame) => {
                decode_errors = 0;
                backoff.reset();
                metrics.frame_captured(&stream_id);
                debug!(stream_id = %stream_id, frame_number = frame.frame_number, "Frame captured");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = frames.send(frame) => {
                        if sent.is_err() {
                            info!(stream_id = %stream_id, "Frame receiver closed, stopping capture");
                            break;
                        }
                    }
                }
            }
            Err(StreamError::Decode(message)) => {
                decode_errors += 1;
                metrics.decode_error(&stream_id);
                warn!(
                    stream_id = %stream_id,
                    consecutive = decode_errors,
                    error = %message,
                    "Frame decode failed"
                );

                if decode_errors >= capture.max_consecutive_decode_errors.max(1) {
                    warn!(stream_id = %stream_id, "Too many decode errors, reopening stream");
                    reader.close();
                    decode_errors = 0;
                    metrics.source_reconnect(&stream_id);
                }
            }
            Err(StreamError::EndOfStream) => {
                info!(stream_id = %stream_id, "End of stream");
                reader.close();
                if capture.stop_on_end_of_stream {
                    break;
                }

                metrics.source_reconnect(&stream_id);
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| capture.reconnect.max_backoff());
                if !pause(delay, &cancel).await {
                    break;
                }
            }
            Err(e) => {
                reader.close();
                metrics.source_reconnect(&stream_id);

                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| capture.reconnect.max_backoff());
                warn!(
                    stream_id = %stream_id,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Stream disconnected, reconnecting"
                );
                if !pause(delay, &cancel).await {
                    break;
                }
            }
        }
    }

    info!(stream_id = %stream_id, "Capture loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SOURCE_RECONNECTS;
    use crate::retry::RetryConfig;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// What one call to `next_frame` returns.
    pub enum Step {
        Frame,
        Garbage,
        Disconnect,
        End,
    }

    /// Scripted source: each `open` consumes the next session, or fails when
    /// the session is `None`.
    pub struct ScriptedSource {
        sessions: Mutex<VecDeque<Option<Vec<Step>>>>,
        pub opens: Mutex<u32>,
    }

    impl ScriptedSource {
        pub fn new(sessions: Vec<Option<Vec<Step>>>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                opens: Mutex::new(0),
            }
        }
    }

    struct ScriptedHandle {
        steps: VecDeque<Step>,
    }

    impl FrameSource for ScriptedSource {
        fn open(&self, _uri: &str) -> Result<Box<dyn FrameHandle>, StreamError> {
            *self.opens.lock() += 1;
            match self.sessions.lock().pop_front() {
                Some(Some(steps)) => Ok(Box::new(ScriptedHandle {
                    steps: steps.into(),
                })),
                Some(None) => Err(StreamError::Connection("refused".to_string())),
                None => Err(StreamError::Connection("script exhausted".to_string())),
            }
        }
    }

    impl FrameHandle for ScriptedHandle {
        fn next_frame(&mut self, _stall: Duration) -> Result<RawImage, StreamError> {
            match self.steps.pop_front() {
                Some(Step::Frame) => Ok(RawImage {
                    width: 8,
                    height: 8,
                    pixels: vec![128; 8 * 8 * 3],
                }),
                Some(Step::Garbage) => Ok(RawImage {
                    width: 8,
                    height: 8,
                    pixels: vec![0; 5],
                }),
                Some(Step::Disconnect) => Err(StreamError::Connection("stalled".to_string())),
                Some(Step::End) | None => Err(StreamError::EndOfStream),
            }
        }
    }

    fn capture_config() -> CaptureConfig {
        CaptureConfig {
            stop_on_end_of_stream: true,
            max_consecutive_decode_errors: 2,
            reconnect: RetryConfig::new(0, 10, 100).without_jitter(),
            ..Default::default()
        }
    }

    async fn collect(source: Arc<ScriptedSource>, rate: SampleRate) -> Vec<Frame> {
        let capture = capture_config();
        let reader = StreamReader::new("lobby", "rtsp://test/stream", source, rate, &capture);
        let (tx, mut rx) = mpsc::channel(64);

        run_capture(
            reader,
            tx,
            capture,
            Arc::new(PipelineMetrics::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_every_nth_sampling() {
        let mut sampler = Sampler::new(SampleRate::EveryNth(3));
        let now = Instant::now();
        let kept: Vec<bool> = (0..7).map(|_| sampler.should_keep(now)).collect();
        assert_eq!(kept, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_fps_sampling() {
        let mut sampler = Sampler::new(SampleRate::Fps(10.0));
        let start = Instant::now();

        assert!(sampler.should_keep(start));
        assert!(!sampler.should_keep(start + Duration::from_millis(50)));
        assert!(sampler.should_keep(start + Duration::from_millis(100)));
        assert!(!sampler.should_keep(start + Duration::from_millis(150)));
        assert!(sampler.should_keep(start + Duration::from_millis(230)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_numbers_survive_reconnect() {
        let source = Arc::new(ScriptedSource::new(vec![
            Some(vec![Step::Frame, Step::Frame, Step::Frame, Step::Disconnect]),
            None,
            Some(vec![Step::Frame, Step::Frame, Step::End]),
        ]));

        let frames = collect(source.clone(), SampleRate::EveryNth(1)).await;
        let numbers: Vec<u64> = frames.iter().map(|f| f.frame_number).collect();

        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        assert_eq!(*source.opens.lock(), 3);
        assert!(frames.iter().all(|f| f.stream_id == "lobby"));
        assert!(frames[0].image_bytes.starts_with(&[0xFF, 0xD8]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_errors_force_reopen() {
        let source = Arc::new(ScriptedSource::new(vec![
            Some(vec![Step::Frame, Step::Garbage, Step::Garbage, Step::Frame]),
            Some(vec![Step::Frame, Step::End]),
        ]));

        let frames = collect(source.clone(), SampleRate::EveryNth(1)).await;

        // The frame queued after the second decode error is never read.
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].frame_number, 1);
        assert_eq!(*source.opens.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_decode_error_is_skipped() {
        let source = Arc::new(ScriptedSource::new(vec![Some(vec![
            Step::Frame,
            Step::Garbage,
            Step::Frame,
            Step::End,
        ])]));

        let frames = collect(source.clone(), SampleRate::EveryNth(1)).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(*source.opens.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_skips_before_encoding() {
        let source = Arc::new(ScriptedSource::new(vec![Some(vec![
            Step::Frame,
            Step::Garbage,
            Step::Frame,
            Step::Garbage,
            Step::Frame,
            Step::End,
        ])]));

        // Every other frame is dropped before it is encoded, so the garbage
        // buffers never cause decode errors.
        let frames = collect(source, SampleRate::EveryNth(2)).await;
        assert_eq!(frames.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retrying() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let capture = capture_config();
        let reader =
            StreamReader::new("lobby", "rtsp://x", source, SampleRate::EveryNth(1), &capture);
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_capture(
            reader,
            tx,
            capture,
            Arc::new(PipelineMetrics::new()),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_source_never_gives_up() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let capture = CaptureConfig {
            reconnect: RetryConfig::new(3, 10, 100).without_jitter(),
            ..capture_config()
        };
        let reader = StreamReader::new(
            "lobby",
            "rtsp://x",
            source.clone(),
            SampleRate::EveryNth(1),
            &capture,
        );
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let metrics = Arc::new(PipelineMetrics::new());

        let task = tokio::spawn(run_capture(reader, tx, capture, metrics.clone(), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_finished());
        assert!(*source.opens.lock() > 10);
        assert!(metrics.render().contains(SOURCE_RECONNECTS));

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
