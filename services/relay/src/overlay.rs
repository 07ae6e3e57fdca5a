//! Detection overlays drawn onto frames for overlay-mode viewers.

use crate::frame::{Detection, Frame};
use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use thiserror::Error;

/// Errors that can occur while rendering an overlay.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Image encode failed: {0}")]
    Encode(String),

    #[error("Overlay renderer unavailable: {0}")]
    Unavailable(String),
}

/// Produces an annotated copy of a frame.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OverlayRenderer: Send + Sync {
    async fn render(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame, OverlayError>;
}

/// Overlay settings for [`BoxOverlayRenderer`].
#[derive(Debug, Clone, Copy)]
pub struct BoxStyle {
    pub color: [u8; 3],
    pub thickness: u32,
    pub jpeg_quality: u8,
}

impl Default for BoxStyle {
    fn default() -> Self {
        Self {
            color: [255, 48, 48],
            thickness: 3,
            jpeg_quality: 80,
        }
    }
}

/// Outlines each detection's bounding box and re-encodes the JPEG.
#[derive(Debug, Clone, Default)]
pub struct BoxOverlayRenderer {
    style: BoxStyle,
}

impl BoxOverlayRenderer {
    pub fn new(style: BoxStyle) -> Self {
        Self { style }
    }
}

#[async_trait]
impl OverlayRenderer for BoxOverlayRenderer {
    async fn render(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame, OverlayError> {
        let style = self.style;
        let payload = frame.bytes().clone();
        let detections = detections.to_vec();

        // Decode and encode are CPU bound.
        let annotated = tokio::task::spawn_blocking(move || draw_boxes(&payload, &detections, style))
            .await
            .map_err(|e| OverlayError::Unavailable(e.to_string()))??;

        Ok(frame.with_payload(annotated))
    }
}

fn draw_boxes(jpeg: &[u8], detections: &[Detection], style: BoxStyle) -> Result<Bytes, OverlayError> {
    let mut image = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map_err(|e| OverlayError::Decode(e.to_string()))?
        .to_rgb8();

    for detection in detections {
        outline(&mut image, detection, &style);
    }

    let mut out = Vec::with_capacity(jpeg.len());
    JpegEncoder::new_with_quality(&mut out, style.jpeg_quality)
        .encode_image(&image)
        .map_err(|e| OverlayError::Encode(e.to_string()))?;

    Ok(Bytes::from(out))
}

/// Draw a hollow rectangle, clipped to the image.
fn outline(image: &mut RgbImage, detection: &Detection, style: &BoxStyle) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let clamp_x = |v: f32| (v.max(0.0) as u32).min(width - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(height - 1);
    let left = clamp_x(detection.x);
    let top = clamp_y(detection.y);
    let right = clamp_x(detection.x + detection.width);
    let bottom = clamp_y(detection.y + detection.height);
    if right <= left || bottom <= top {
        return;
    }

    let color = Rgb(style.color);
    for t in 0..style.thickness {
        let (l, r) = (left + t, right.saturating_sub(t));
        let (tp, b) = (top + t, bottom.saturating_sub(t));
        if r <= l || b <= tp {
            break;
        }
        for x in l..=r {
            image.put_pixel(x, tp, color);
            image.put_pixel(x, b, color);
        }
        for y in tp..=b {
            image.put_pixel(l, y, color);
            image.put_pixel(r, y, color);
        }
    }
}
