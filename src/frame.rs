//! Decoded video frames.
//!
//! - `Frame`: owned RGB image plus capture metadata.
//! - JPEG decode/encode at the ingestion and relay boundaries.
//! - ROI crops for the recognition capability.
//! - Box overlays for annotated relay output.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, Rgb, RgbImage};

use crate::error::PollError;
use crate::model::BoundingBox;
use crate::now_ms;

/// Upper bound on a single encoded frame accepted from the network.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub const PERSON_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const BUS_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const ZONE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

pub struct Frame {
    image: RgbImage,
    /// Wall-clock capture time, milliseconds since epoch.
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn from_rgb(image: RgbImage) -> Self {
        Self {
            image,
            captured_at_ms: now_ms(),
        }
    }

    /// Solid-colour frame, mostly for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::from_rgb(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    /// Decode a JPEG payload. Empty or undecodable bytes are a `DecodeFailure`.
    pub fn decode_jpeg(bytes: &[u8]) -> Result<Self, PollError> {
        if bytes.is_empty() {
            return Err(PollError::DecodeFailure(anyhow!("empty image payload")));
        }
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(PollError::DecodeFailure(anyhow!(
                "image payload of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
            .context("decode jpeg")
            .map_err(PollError::DecodeFailure)?;
        let rgb = image.into_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(PollError::DecodeFailure(anyhow!("decoded image is empty")));
        }
        Ok(Self::from_rgb(rgb))
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 * 1024);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(
                self.image.as_raw(),
                self.image.width(),
                self.image.height(),
                ExtendedColorType::Rgb8,
            )
            .context("encode jpeg")?;
        Ok(out)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Crop `bbox` grown by `padding` pixels, clamped to the frame.
    /// Returns `None` when the clamped region is empty.
    pub fn crop_padded(&self, bbox: &BoundingBox, padding: u32) -> Option<Frame> {
        let pad = padding as f32;
        let x1 = (bbox.x1 - pad).max(0.0).floor() as u32;
        let y1 = (bbox.y1 - pad).max(0.0).floor() as u32;
        let x2 = ((bbox.x2 + pad).ceil().max(0.0) as u32).min(self.width());
        let y2 = ((bbox.y2 + pad).ceil().max(0.0) as u32).min(self.height());
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        let roi = image::imageops::crop_imm(&self.image, x1, y1, x2 - x1, y2 - y1).to_image();
        Some(Frame {
            image: roi,
            captured_at_ms: self.captured_at_ms,
        })
    }

    /// Draw a rectangle outline of `thickness` pixels.
    pub fn draw_box(&mut self, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
        let (w, h) = (self.width(), self.height());
        if w == 0 || h == 0 {
            return;
        }
        let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
        let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
        let (x1, x2) = (clamp_x(bbox.x1), clamp_x(bbox.x2));
        let (y1, y2) = (clamp_y(bbox.y1), clamp_y(bbox.y2));
        if x2 < x1 || y2 < y1 {
            return;
        }
        for t in 0..thickness {
            let top = (y1 + t).min(y2);
            let bottom = y2.saturating_sub(t).max(y1);
            let left = (x1 + t).min(x2);
            let right = x2.saturating_sub(t).max(x1);
            for x in x1..=x2 {
                self.image.put_pixel(x, top, color);
                self.image.put_pixel(x, bottom, color);
            }
            for y in y1..=y2 {
                self.image.put_pixel(left, y, color);
                self.image.put_pixel(right, y, color);
            }
        }
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        Self {
            image: self.image.clone(),
            captured_at_ms: self.captured_at_ms,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at_ms", &self.captured_at_ms)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
