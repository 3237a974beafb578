//! Frame-rate gating for live sessions.
//!
//! A frame is emitted only when both gates pass:
//! 1. at least `max(1, round(source / target))` frames have arrived since the
//!    last emitted frame (the skip factor)
//! 2. at least `1 / target` seconds have passed since the last emitted frame
//!
//! The skip count restarts at each emission, so a skip-aligned frame that
//! arrives just before the wall-clock gate opens holds the slot for the next
//! frame instead of waiting for the next multiple of the skip factor.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FpsMode {
    Active,
    #[default]
    Passive,
}

impl FpsMode {
    /// Unknown or missing values fall back to passive.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("active") => FpsMode::Active,
            _ => FpsMode::Passive,
        }
    }

    pub fn target_fps(&self) -> f32 {
        match self {
            FpsMode::Active => 8.0,
            FpsMode::Passive => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FpsMode::Active => "active",
            FpsMode::Passive => "passive",
        }
    }
}

pub fn skip_factor(source_fps: f32, target_fps: f32) -> u32 {
    if !(source_fps > 0.0 && target_fps > 0.0) {
        return 1;
    }
    ((source_fps / target_fps).round() as u32).max(1)
}

#[derive(Clone, Debug)]
pub struct RateGate {
    skip: u32,
    min_interval: Duration,
    since_emit: u32,
    last_emit: Option<Instant>,
}

impl RateGate {
    /// A source without a known rate gets skip factor 1 and relies on the
    /// wall-clock gate alone.
    pub fn new(source_fps: Option<f32>, mode: FpsMode) -> Self {
        let target = mode.target_fps();
        let skip = source_fps.map(|fps| skip_factor(fps, target)).unwrap_or(1);
        Self {
            skip,
            min_interval: Duration::from_secs_f32(1.0 / target),
            // The first frame is always eligible.
            since_emit: skip - 1,
            last_emit: None,
        }
    }

    pub fn skip(&self) -> u32 {
        self.skip
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Offer the next incoming frame; true when it should be emitted.
    pub fn admit(&mut self, now: Instant) -> bool {
        self.since_emit = self.since_emit.saturating_add(1);
        if self.since_emit < self.skip {
            return false;
        }
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.since_emit = 0;
        self.last_emit = Some(now);
        true
    }

    /// Time until the wall-clock gate opens.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_emit {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}
