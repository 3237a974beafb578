use serde::{Deserialize, Serialize};

use crate::model::BoundingBox;

/// COCO class ids the monitor cares about.
pub const COCO_PERSON: u16 = 0;
pub const COCO_BUS: u16 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Bus,
    Other(u16),
}

impl ObjectClass {
    pub fn from_coco(class_id: u16) -> Self {
        match class_id {
            COCO_PERSON => ObjectClass::Person,
            COCO_BUS => ObjectClass::Bus,
            other => ObjectClass::Other(other),
        }
    }
}

/// One typed box from the detector, in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub class: ObjectClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl DetectedObject {
    pub fn new(class: ObjectClass, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class,
            confidence,
            bbox,
        }
    }
}

/// Detector output for one frame, split by tracked class.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSample {
    pub people: Vec<DetectedObject>,
    pub buses: Vec<DetectedObject>,
}

impl DetectionSample {
    pub fn from_objects(objects: Vec<DetectedObject>) -> Self {
        let mut sample = Self::default();
        for object in objects {
            match object.class {
                ObjectClass::Person => sample.people.push(object),
                ObjectClass::Bus => sample.buses.push(object),
                ObjectClass::Other(_) => {}
            }
        }
        sample
    }
}
