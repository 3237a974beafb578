use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectedObject;
use crate::frame::Frame;

/// Stub backend for testing and offline runs.
///
/// Returns a fixed detection list, or replays a script of per-frame lists and
/// then repeats the fixed list once the script is exhausted.
pub struct StubBackend {
    fixed: Vec<DetectedObject>,
    script: Mutex<VecDeque<Vec<DetectedObject>>>,
}

impl StubBackend {
    pub fn new(fixed: Vec<DetectedObject>) -> Self {
        Self {
            fixed,
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Per-frame results, consumed in order before falling back to `fixed`.
    pub fn scripted(script: Vec<Vec<DetectedObject>>, fixed: Vec<DetectedObject>) -> Self {
        Self {
            fixed,
            script: Mutex::new(script.into()),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::empty()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedObject>> {
        let mut script = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(script.pop_front().unwrap_or_else(|| self.fixed.clone()))
    }
}
