//! Draws detections onto frames.

use crate::config::StorageConfig;
use crate::frame::{encode_jpeg, storage_key, AnnotatedArtifact, DetectionBox, DetectionResult, Frame};
use ab_glyph::{FontRef, PxScale};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::warn;

const LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

/// Box colours, cycled by label.
const PALETTE: [Rgb<u8>; 10] = [
    Rgb([0, 0, 255]),
    Rgb([0, 255, 0]),
    Rgb([255, 0, 0]),
    Rgb([0, 255, 255]),
    Rgb([255, 0, 255]),
    Rgb([255, 255, 0]),
    Rgb([255, 0, 128]),
    Rgb([0, 128, 255]),
    Rgb([255, 128, 0]),
    Rgb([0, 255, 128]),
];

const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_PADDING: u32 = 2;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Failed to encode annotated frame: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct AnnotateOptions {
    pub jpeg_quality: u8,
    pub line_thickness: u32,
    /// Label text height in pixels
    pub font_size: f32,
    pub key_prefix: String,
}

impl Default for AnnotateOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            line_thickness: 2,
            font_size: 13.0,
            key_prefix: "annotated".to_string(),
        }
    }
}

impl From<&StorageConfig> for AnnotateOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            jpeg_quality: config.jpeg_quality,
            key_prefix: config.key_prefix.clone(),
            ..Default::default()
        }
    }
}

/// Palette colour for a label; the same label always gets the same colour.
pub fn label_color(label: &str) -> Rgb<u8> {
    // FNV-1a
    let hash = label
        .bytes()
        .fold(0xcbf29ce484222325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x100000001b3));
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

/// Render `result` onto `frame` and wrap it as a storable artifact.
pub fn annotate(
    frame: &Frame,
    result: &DetectionResult,
    options: &AnnotateOptions,
) -> Result<AnnotatedArtifact, AnnotateError> {
    let mut img = image::load_from_memory_with_format(&frame.image_bytes, ImageFormat::Jpeg)
        .map_err(|e| AnnotateError::Decode(e.to_string()))?
        .to_rgb8();

    let font = match FontRef::try_from_slice(LABEL_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!(error = %e, "Failed to load label font, drawing boxes only");
            None
        }
    };

    for detection in &result.boxes {
        draw_detection(&mut img, detection, options, font.as_ref());
    }

    let image_bytes = encode_jpeg(&img, options.jpeg_quality)
        .map_err(|e| AnnotateError::Encode(e.to_string()))?;

    Ok(AnnotatedArtifact {
        storage_key: storage_key(
            &options.key_prefix,
            &frame.stream_id,
            frame.captured_at,
            frame.frame_number,
        ),
        image_bytes,
        stream_id: frame.stream_id.clone(),
        frame_number: frame.frame_number,
        captured_at: frame.captured_at,
        detections: result.boxes.len(),
    })
}

/// Clip a box to the image. None for non-finite or empty boxes.
fn clip(detection: &DetectionBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let coords = [detection.x, detection.y, detection.w, detection.h];
    if coords.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let x0 = detection.x.max(0.0).min(width as f32) as u32;
    let y0 = detection.y.max(0.0).min(height as f32) as u32;
    let x1 = (detection.x + detection.w).max(0.0).min(width as f32) as u32;
    let y1 = (detection.y + detection.h).max(0.0).min(height as f32) as u32;

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0, y0, x1 - x0, y1 - y0))
}

fn draw_detection(
    img: &mut RgbImage,
    detection: &DetectionBox,
    options: &AnnotateOptions,
    font: Option<&FontRef>,
) {
    let (width, height) = img.dimensions();
    let Some((x, y, w, h)) = clip(detection, width, height) else {
        return;
    };
    let color = label_color(&detection.label);

    for t in 0..options.line_thickness.max(1) {
        let inner_w = w.saturating_sub(2 * t);
        let inner_h = h.saturating_sub(2 * t);
        if inner_w > 0 && inner_h > 0 {
            let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(inner_w, inner_h);
            draw_hollow_rect_mut(img, rect, color);
        }
    }

    let Some(font) = font else {
        return;
    };

    // Label strip above the box, or just inside it at the top edge
    let text = format!("{}: {:.2}", detection.label, detection.confidence);
    let scale = PxScale::from(options.font_size);
    let (text_w, text_h) = text_size(scale, font, &text);
    let strip_w = (text_w + 2 * LABEL_PADDING).min(width - x);
    let strip_h = (text_h + 2 * LABEL_PADDING).min(height);
    let strip_y = if y >= strip_h { y - strip_h } else { y };
    if strip_w == 0 || strip_h == 0 {
        return;
    }

    let rect = Rect::at(x as i32, strip_y as i32).of_size(strip_w, strip_h);
    draw_filled_rect_mut(img, rect, color);
    draw_text_mut(
        img,
        LABEL_TEXT_COLOR,
        (x + LABEL_PADDING) as i32,
        (strip_y + LABEL_PADDING) as i32,
        scale,
        font,
        &text,
    );
}
