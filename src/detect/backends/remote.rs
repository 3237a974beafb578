//! Remote HTTP detector.
//!
//! POSTs the frame as JPEG to the configured URL and expects:
//! `{"detections": [{"class_id": 0, "confidence": 0.8, "bbox": [x1, y1, x2, y2]}]}`

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{DetectedObject, ObjectClass};
use crate::frame::Frame;
use crate::model::BoundingBox;

const UPLOAD_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    class_id: u16,
    confidence: f32,
    bbox: [f32; 4],
}

pub struct RemoteBackend {
    url: String,
    agent: ureq::Agent,
}

impl RemoteBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.into(),
            agent,
        }
    }
}

impl DetectorBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<DetectedObject>> {
        let jpeg = frame.encode_jpeg(UPLOAD_JPEG_QUALITY)?;
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("POST frame to detector {}", self.url))?;
        let body: DetectResponse = response
            .into_json()
            .context("parse detector response")?;
        body.detections
            .into_iter()
            .map(|raw| {
                if !(0.0..=1.0).contains(&raw.confidence) {
                    return Err(anyhow!("detector returned confidence {}", raw.confidence));
                }
                Ok(DetectedObject::new(
                    ObjectClass::from_coco(raw.class_id),
                    raw.confidence,
                    BoundingBox::from(raw.bbox),
                ))
            })
            .collect()
    }
}
