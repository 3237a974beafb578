//! Consumed recognition capability: reads a route/plate identifier from a
//! bus ROI. Only ever invoked on bus detections.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::frame::Frame;
use crate::model::BoundingBox;

/// Pixels of context added around a bus box before recognition.
pub const ROI_PADDING: u32 = 10;
const MIN_IDENTIFIER_LEN: usize = 2;

pub trait PlateRecognizer: Send + Sync {
    /// Raw recognized text for the ROI, or `None` when nothing was read.
    fn recognize(&self, roi: &Frame) -> Result<Option<String>>;
}

/// Recognizer used when no recognition service is configured.
#[derive(Clone, Debug, Default)]
pub struct NoopRecognizer;

impl PlateRecognizer for NoopRecognizer {
    fn recognize(&self, _roi: &Frame) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    text: Option<String>,
}

/// Remote OCR service. POSTs the ROI as JPEG, expects `{"text": "..."}`.
pub struct RemoteRecognizer {
    url: String,
    agent: ureq::Agent,
}

impl RemoteRecognizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl PlateRecognizer for RemoteRecognizer {
    fn recognize(&self, roi: &Frame) -> Result<Option<String>> {
        let jpeg = roi.encode_jpeg(90)?;
        let body: RecognizeResponse = self
            .agent
            .post(&self.url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("POST roi to recognizer {}", self.url))?
            .into_json()
            .context("parse recognizer response")?;
        Ok(body.text)
    }
}

fn is_plate_char(c: char) -> bool {
    c.is_ascii_digit() || c.is_ascii_uppercase() || ('А'..='Я').contains(&c)
}

/// Upper-case, drop everything except digits and Latin/Cyrillic capitals, and
/// reject results shorter than two characters.
pub fn normalize_plate(raw: &str) -> Option<String> {
    let cleaned: String = raw.to_uppercase().chars().filter(|c| is_plate_char(*c)).collect();
    if cleaned.chars().count() >= MIN_IDENTIFIER_LEN {
        Some(cleaned)
    } else {
        None
    }
}

/// Crop the padded bus ROI and run recognition. Failures degrade to `None`.
pub fn recognize_bus(
    recognizer: &dyn PlateRecognizer,
    frame: &Frame,
    bbox: &BoundingBox,
) -> Option<String> {
    let roi = frame.crop_padded(bbox, ROI_PADDING)?;
    match recognizer.recognize(&roi) {
        Ok(text) => text.as_deref().and_then(normalize_plate),
        Err(err) => {
            log::warn!("bus identifier recognition failed: {:#}", err);
            None
        }
    }
}
