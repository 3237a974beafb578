//! Consumed detection and recognition capabilities.
//!
//! The object detector and the plate/route recognizer are external. This
//! module defines the narrow seams they are reached through, a stub and a
//! remote HTTP implementation of each, and the post-detection policy that
//! decides which raw boxes count.

mod backend;
mod backends;
mod ocr;
mod policy;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{RemoteBackend, StubBackend};
pub use ocr::{normalize_plate, recognize_bus, NoopRecognizer, PlateRecognizer, RemoteRecognizer};
pub use policy::DetectionPolicy;
pub use registry::BackendRegistry;
pub use result::{DetectedObject, DetectionSample, ObjectClass};
