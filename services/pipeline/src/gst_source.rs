//! GStreamer-backed [`FrameSource`].
//!
//! Frames are pulled from an `appsink` with a timeout rather than pushed
//! through callbacks, so the reader decides when it wants the next frame and
//! a stalled source surfaces as a timeout on that pull.

use crate::stream_reader::{FrameHandle, FrameSource, RawImage, StreamError};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a freshly built pipeline may take to reach `Playing`.
const STARTUP_TIMEOUT_SECS: u64 = 10;

/// Opens RTSP (or any gstreamer-decodable) URIs.
#[derive(Debug, Clone)]
pub struct GstFrameSource {
    transport: String,
    latency_ms: u32,
}

impl GstFrameSource {
    pub fn new(transport: impl Into<String>, latency_ms: u32) -> Result<Self, StreamError> {
        gst::init().map_err(|e| StreamError::Connection(format!("gstreamer init: {}", e)))?;
        Ok(Self {
            transport: transport.into(),
            latency_ms,
        })
    }
}

/// Build the launch description for `uri`, ending in an RGB appsink named `sink`.
pub fn pipeline_description(uri: &str, transport: &str, latency_ms: u32) -> String {
    let sink = "videoconvert ! video/x-raw,format=RGB \
                ! appsink name=sink sync=false max-buffers=2 drop=true";

    if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        let protocols = match transport {
            "udp" => "udp",
            "udp-mcast" => "udp-mcast",
            _ => "tcp",
        };
        format!(
            "rtspsrc location={uri} protocols={protocols} latency={latency} \
             ! decodebin ! {sink}",
            uri = uri,
            protocols = protocols,
            latency = latency_ms,
            sink = sink,
        )
    } else {
        format!("uridecodebin uri={uri} ! {sink}", uri = uri, sink = sink)
    }
}

impl FrameSource for GstFrameSource {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameHandle>, StreamError> {
        let description = pipeline_description(uri, &self.transport, self.latency_ms);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| StreamError::Connection(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| StreamError::Connection("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| StreamError::Connection("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| StreamError::Connection("Could not cast to AppSink".to_string()))?;

        let handle = GstHandle { pipeline, appsink };

        handle
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        let (result, _state, _pending) = handle
            .pipeline
            .state(gst::ClockTime::from_seconds(STARTUP_TIMEOUT_SECS));
        if result.is_err() {
            return Err(StreamError::Connection(
                "Timeout waiting for pipeline to start".to_string(),
            ));
        }

        Ok(Box::new(handle))
    }
}

struct GstHandle {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GstHandle {
    /// Surface pipeline errors that arrived since the last pull.
    fn check_bus(&self) -> Result<(), StreamError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };

        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(StreamError::Connection(format!(
                        "{} ({:?})",
                        err.error(),
                        err.debug()
                    )));
                }
                gst::MessageView::Warning(w) => {
                    warn!(warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameHandle for GstHandle {
    fn next_frame(&mut self, stall_timeout: Duration) -> Result<RawImage, StreamError> {
        self.check_bus()?;

        let timeout = gst::ClockTime::from_nseconds(stall_timeout.as_nanos() as u64);
        let sample = match self.appsink.try_pull_sample(timeout) {
            Some(sample) => sample,
            None if self.appsink.is_eos() => return Err(StreamError::EndOfStream),
            None => {
                self.check_bus()?;
                return Err(StreamError::Connection(format!(
                    "no frame within {:?}",
                    stall_timeout
                )));
            }
        };

        let caps = sample
            .caps()
            .ok_or_else(|| StreamError::Decode("sample without caps".to_string()))?;
        let structure = caps
            .structure(0)
            .ok_or_else(|| StreamError::Decode("caps without structure".to_string()))?;
        let width = structure
            .get::<i32>("width")
            .map_err(|e| StreamError::Decode(e.to_string()))? as u32;
        let height = structure
            .get::<i32>("height")
            .map_err(|e| StreamError::Decode(e.to_string()))? as u32;

        let buffer = sample
            .buffer()
            .ok_or_else(|| StreamError::Decode("sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| StreamError::Decode(e.to_string()))?;

        Ok(RawImage {
            width,
            height,
            pixels: pack_rows(map.as_slice(), width, height)?,
        })
    }
}

impl Drop for GstHandle {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Strip row padding: RGB rows are aligned to 4 bytes by videoconvert.
fn pack_rows(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, StreamError> {
    let row = width as usize * 3;
    let height = height as usize;
    if height == 0 || row == 0 {
        return Err(StreamError::Decode("empty frame".to_string()));
    }

    let stride = data.len() / height;
    if stride < row {
        return Err(StreamError::Decode(format!(
            "buffer of {} bytes is too small for {}x{} RGB",
            data.len(),
            width,
            height
        )));
    }
    if stride == row {
        return Ok(data[..row * height].to_vec());
    }

    let mut pixels = Vec::with_capacity(row * height);
    for line in data.chunks(stride).take(height) {
        pixels.extend_from_slice(&line[..row]);
    }
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_string_tcp() {
        let pipeline = pipeline_description("rtsp://test:554/stream", "tcp", 200);
        assert!(pipeline.contains("protocols=tcp"));
        assert!(pipeline.contains("rtsp://test:554/stream"));
        assert!(pipeline.contains("latency=200"));
        assert!(pipeline.ends_with("drop=true"));
    }

    #[test]
    fn test_pipeline_string_udp() {
        let pipeline = pipeline_description("rtsp://test:554/stream", "udp", 200);
        assert!(pipeline.contains("protocols=udp"));
    }

    #[test]
    fn test_pipeline_string_file() {
        let pipeline = pipeline_description("file:///tmp/clip.mp4", "tcp", 200);
        assert!(pipeline.starts_with("uridecodebin uri=file:///tmp/clip.mp4"));
    }

    #[test]
    fn test_pack_rows_strips_padding() {
        // 1x2 RGB with rows padded to 4 bytes
        let data = [1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(pack_rows(&data, 1, 2).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_pack_rows_rejects_short_buffer() {
        assert!(matches!(
            pack_rows(&[0; 5], 2, 2),
            Err(StreamError::Decode(_))
        ));
    }
}
