use anyhow::Result;

use crate::detect::result::DetectedObject;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Implementations are shared by every poll worker and relay session, so
/// `detect` takes `&self`; a backend with mutable state guards it internally.
/// Errors are reported by callers as `DetectionProviderError`.
pub trait DetectorBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Boxes are in frame pixel coordinates.
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectedObject>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
