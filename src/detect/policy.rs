//! Post-detection filter: which raw boxes count as people and buses.

use serde::{Deserialize, Serialize};

use super::result::{DetectedObject, DetectionSample, ObjectClass};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionPolicy {
    /// Global floor applied before the per-class rules.
    pub confidence_threshold: f32,
    /// Minimum person box area as a fraction of the frame area.
    pub person_min_area_ratio: f32,
    /// Persons below the area floor are still kept above this confidence.
    pub person_override_confidence: f32,
    /// Person aspect ratio (h / w) must lie strictly inside this range.
    pub person_aspect_range: (f32, f32),
    pub bus_min_area_ratio: f32,
    pub bus_override_confidence: f32,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.2,
            person_min_area_ratio: 0.000_05,
            person_override_confidence: 0.25,
            person_aspect_range: (0.3, 3.0),
            bus_min_area_ratio: 0.000_5,
            bus_override_confidence: 0.4,
        }
    }
}

impl DetectionPolicy {
    pub fn with_threshold(confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold,
            ..Self::default()
        }
    }

    /// Accept nothing below the floor, then apply the per-class rules.
    pub fn apply(&self, objects: Vec<DetectedObject>, width: u32, height: u32) -> DetectionSample {
        let frame_area = (width as f32) * (height as f32);
        let kept = objects
            .into_iter()
            .filter(|o| o.confidence >= self.confidence_threshold)
            .filter(|o| self.keeps(o, frame_area))
            .collect();
        DetectionSample::from_objects(kept)
    }

    fn keeps(&self, object: &DetectedObject, frame_area: f32) -> bool {
        let area = object.bbox.area();
        match object.class {
            ObjectClass::Person => {
                let width = object.bbox.width();
                if width <= 0.0 {
                    return false;
                }
                let aspect = object.bbox.height() / width;
                let (lo, hi) = self.person_aspect_range;
                let big_enough = area >= frame_area * self.person_min_area_ratio
                    || object.confidence > self.person_override_confidence;
                big_enough && aspect > lo && aspect < hi
            }
            ObjectClass::Bus => {
                area >= frame_area * self.bus_min_area_ratio
                    || object.confidence > self.bus_override_confidence
            }
            ObjectClass::Other(_) => false,
        }
    }
}
