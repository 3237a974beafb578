//! Core data model: stops, geometry, persisted observations and poll outcomes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FailureKind, PollError};

pub type StopId = i64;

/// A 2D point in frame pixel coordinates. Serialized as `[x, y]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<[f32; 2]> for Point {
    fn from(v: [f32; 2]) -> Self {
        Self { x: v[0], y: v[1] }
    }
}

impl From<Point> for [f32; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned box in pixel coordinates. Serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box of the given size centred on `(cx, cy)`.
    pub fn centered(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            x1: cx - width / 2.0,
            y1: cy - height / 2.0,
            x2: cx + width / 2.0,
            y2: cy + height / 2.0,
        }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// A monitored transit stop. Owned by the admin layer; read-only here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub zone: Vec<Point>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

fn default_active() -> bool {
    true
}

impl Stop {
    /// A stop is pollable iff it is active, has a camera, and has a zone.
    pub fn is_pollable(&self) -> bool {
        self.active
            && self
                .camera_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty())
            && !self.zone.is_empty()
    }

    /// Camera id and zone of a pollable stop, or `ConfigurationIncomplete`.
    pub fn pollable_parts(&self) -> Result<(&str, &[Point]), PollError> {
        if !self.active {
            return Err(PollError::configuration(format!(
                "stop {} is inactive",
                self.id
            )));
        }
        let camera_id = self
            .camera_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                PollError::configuration(format!("stop {} has no camera id", self.id))
            })?;
        if self.zone.is_empty() {
            return Err(PollError::configuration(format!(
                "stop {} has no zone polygon",
                self.id
            )));
        }
        Ok((camera_id, &self.zone))
    }
}

/// Integer people/bus counts for one observation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationCounts {
    pub people: u32,
    pub buses: u32,
}

/// Persisted aggregate for a stop at a point in time. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadRecord {
    pub stop_id: StopId,
    pub timestamp_ms: i64,
    pub people_count: u32,
    pub bus_count: u32,
    pub payload: serde_json::Value,
}

/// Persisted sighting of one detected bus. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusSighting {
    pub stop_id: StopId,
    pub detected_at_ms: i64,
    pub recognized_id: Option<String>,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub payload: serde_json::Value,
}

impl BusSighting {
    /// Replay key: hex(SHA-256(stop_id, detected_at_ms, bbox)).
    pub fn sighting_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.stop_id.to_le_bytes());
        hasher.update(self.detected_at_ms.to_le_bytes());
        for v in [self.bbox.x1, self.bbox.y1, self.bbox.x2, self.bbox.y2] {
            hasher.update(v.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Result of one poll task. Ephemeral; reported to the dispatcher or caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollOutcome {
    Success {
        stop_id: StopId,
        record_id: i64,
        people_count: u32,
        bus_count: u32,
        people_before: u32,
        recognized_buses: Vec<String>,
    },
    Failure {
        stop_id: StopId,
        kind: FailureKind,
        reason: String,
    },
}

impl PollOutcome {
    pub fn failure(stop_id: StopId, err: &PollError) -> Self {
        PollOutcome::Failure {
            stop_id,
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    pub fn stop_id(&self) -> StopId {
        match self {
            PollOutcome::Success { stop_id, .. } | PollOutcome::Failure { stop_id, .. } => {
                *stop_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PollOutcome::Success { .. } => None,
            PollOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}
