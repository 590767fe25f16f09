//! Shared data model: frames, their broker envelope, detections and the
//! annotated artifacts written to object storage.

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageResult, RgbImage};
use serde::{Deserialize, Serialize};

/// A sampled, JPEG-encoded video frame. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: String,
    /// Monotonically increasing within a stream, never reset on reconnect
    pub frame_number: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// JPEG bytes
    pub image_bytes: Vec<u8>,
}

impl Frame {
    /// Serialize this frame as the JSON broker payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&FrameEnvelopeRef::from(self))
    }

    /// Decode a broker payload produced by [`Frame::to_payload`].
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: FrameEnvelope = serde_json::from_slice(payload)?;
        Ok(envelope.into())
    }
}

/// Broker payload for a frame.
///
/// ```json
/// {"stream_id": "lobby", "frame_number": 42, "timestamp": "2024-01-15T10:30:00Z",
///  "width": 1280, "height": 720, "frame_data": "<base64 JPEG>"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub stream_id: String,
    pub frame_number: u64,
    /// RFC 3339; a timestamp without an offset is read as UTC
    #[serde(deserialize_with = "timestamp_serde::deserialize")]
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    #[serde(with = "base64_serde")]
    pub frame_data: Vec<u8>,
}

/// Borrowing twin of [`FrameEnvelope`] so publishing does not copy the image.
#[derive(Serialize)]
struct FrameEnvelopeRef<'a> {
    stream_id: &'a str,
    frame_number: u64,
    timestamp: DateTime<Utc>,
    width: u32,
    height: u32,
    #[serde(serialize_with = "base64_serde::serialize")]
    frame_data: &'a [u8],
}

impl<'a> From<&'a Frame> for FrameEnvelopeRef<'a> {
    fn from(frame: &'a Frame) -> Self {
        Self {
            stream_id: &frame.stream_id,
            frame_number: frame.frame_number,
            timestamp: frame.captured_at,
            width: frame.width,
            height: frame.height,
            frame_data: &frame.image_bytes,
        }
    }
}

impl From<FrameEnvelope> for Frame {
    fn from(envelope: FrameEnvelope) -> Self {
        Self {
            stream_id: envelope.stream_id,
            frame_number: envelope.frame_number,
            captured_at: envelope.timestamp,
            width: envelope.width,
            height: envelope.height,
            image_bytes: envelope.frame_data,
        }
    }
}

/// Accepts both offset-carrying and naive ISO 8601 timestamps.
pub(crate) mod timestamp_serde {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{}': {}", s, e)))
    }
}

/// Base64 serialization helper
pub(crate) mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// One detected object, in pixel coordinates of the source frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl DetectionBox {
    /// Build a box from corner coordinates.
    pub fn from_corners(
        label: impl Into<String>,
        confidence: f32,
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
    ) -> Self {
        Self {
            label: label.into(),
            confidence,
            x: x1.min(x2),
            y: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }
}

/// Detections for a single frame of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_number: u64,
    pub boxes: Vec<DetectionBox>,
}

/// An annotated frame ready for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedArtifact {
    /// Deterministic object key; redelivery of the same frame overwrites it
    pub storage_key: String,
    pub image_bytes: Vec<u8>,
    pub stream_id: String,
    pub frame_number: u64,
    pub captured_at: DateTime<Utc>,
    pub detections: usize,
}

/// Object key for an annotated frame:
/// `{prefix}/{stream_id}/{YYYY-MM-DD}/{frame_number}.jpg`.
///
/// The date comes from the capture timestamp, never the processing time,
/// so reprocessing a frame always lands on the same key.
pub fn storage_key(
    prefix: &str,
    stream_id: &str,
    captured_at: DateTime<Utc>,
    frame_number: u64,
) -> String {
    let prefix = prefix.trim_matches('/');
    let stream = sanitize_path_component(stream_id);
    let date = captured_at.format("%Y-%m-%d");

    if prefix.is_empty() {
        format!("{}/{}/{}.jpg", stream, date, frame_number)
    } else {
        format!("{}/{}/{}/{}.jpg", prefix, stream, date, frame_number)
    }
}

/// Encode an RGB image as JPEG at the given quality (1-100).
pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(bytes)
}

/// Sanitize a path component to prevent path traversal
pub(crate) fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_frame() -> Frame {
        Frame {
            stream_id: "lobby".to_string(),
            frame_number: 7,
            captured_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap(),
            width: 64,
            height: 48,
            image_bytes: b"Hello World".to_vec(),
        }
    }

    #[test]
    fn test_deserialize_envelope() {
        let json = r#"{
            "stream_id": "stream_1a2b3c4d",
            "frame_number": 12345,
            "timestamp": "2024-01-15T10:30:00Z",
            "width": 1920,
            "height": 1080,
            "frame_data": "SGVsbG8gV29ybGQ="
        }"#;

        let frame = Frame::from_payload(json.as_bytes()).unwrap();
        assert_eq!(frame.stream_id, "stream_1a2b3c4d");
        assert_eq!(frame.frame_number, 12345);
        assert_eq!(frame.image_bytes, b"Hello World");
    }

    #[test]
    fn test_naive_timestamp_read_as_utc() {
        let envelope = |timestamp: &str| {
            format!(
                r#"{{"stream_id":"lobby","frame_number":1,"timestamp":"{}","width":2,"height":2,"frame_data":""}}"#,
                timestamp
            )
        };

        let naive = Frame::from_payload(envelope("2024-01-15T10:30:45.250").as_bytes()).unwrap();
        assert_eq!(
            naive.captured_at,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap() + chrono::Duration::milliseconds(250)
        );

        let offset = Frame::from_payload(envelope("2024-01-15T12:30:45+02:00").as_bytes()).unwrap();
        assert_eq!(offset.captured_at, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap());

        assert!(Frame::from_payload(envelope("15/01/2024 10:30").as_bytes()).is_err());
    }

    #[test]
    fn test_payload_uses_wire_field_names() {
        let payload = test_frame().to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["frame_data"], "SGVsbG8gV29ybGQ=");
        assert_eq!(value["timestamp"], "2024-01-15T10:30:45Z");
        assert_eq!(Frame::from_payload(&payload).unwrap(), test_frame());
    }

    #[test]
    fn test_malformed_payload() {
        assert!(Frame::from_payload(b"not json").is_err());
        assert!(Frame::from_payload(br#"{"stream_id": "x"}"#).is_err());
    }

    #[test]
    fn test_storage_key_format() {
        let frame = test_frame();
        assert_eq!(
            storage_key("annotated", &frame.stream_id, frame.captured_at, 7),
            "annotated/lobby/2024-01-15/7.jpg"
        );
        assert_eq!(
            storage_key("/annotated/", "cam/../x", frame.captured_at, 7),
            "annotated/cam____x/2024-01-15/7.jpg"
        );
        assert_eq!(
            storage_key("", "lobby", frame.captured_at, 0),
            "lobby/2024-01-15/0.jpg"
        );
    }

    #[test]
    fn test_box_from_corners() {
        let b = DetectionBox::from_corners("person", 0.9, 30.0, 40.0, 10.0, 20.0);
        assert_eq!((b.x, b.y, b.w, b.h), (10.0, 20.0, 20.0, 20.0));
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("glasses-001"), "glasses-001");
        assert_eq!(sanitize_path_component("device/path"), "device_path");
        assert_eq!(sanitize_path_component("dev..ice"), "dev__ice");
    }
}
