//! Failure taxonomy for poll tasks and relay sessions.
//!
//! Every failure that crosses a task or connection boundary is a `PollError`.
//! Callers branch on `PollError::kind()` only; the wrapped cause is kept for
//! logging and for the human-readable `reason` reported in outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of failure kinds surfaced in `PollOutcome`s and stats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CameraUnavailable,
    DecodeFailure,
    DetectionProviderError,
    PersistenceError,
    SkippedOverlap,
    ConfigurationIncomplete,
    BudgetExceeded,
    WorkerPoolSaturated,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CameraUnavailable => "camera_unavailable",
            FailureKind::DecodeFailure => "decode_failure",
            FailureKind::DetectionProviderError => "detection_provider_error",
            FailureKind::PersistenceError => "persistence_error",
            FailureKind::SkippedOverlap => "skipped_overlap",
            FailureKind::ConfigurationIncomplete => "configuration_incomplete",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::WorkerPoolSaturated => "worker_pool_saturated",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// No candidate endpoint opened or produced a frame.
    #[error("camera unavailable: {0:#}")]
    CameraUnavailable(anyhow::Error),

    /// Bytes were received but are not a valid image or stream.
    #[error("decode failure: {0:#}")]
    DecodeFailure(anyhow::Error),

    /// The external detection capability raised.
    #[error("detection provider error: {0:#}")]
    DetectionProviderError(anyhow::Error),

    /// A storage write failed; the task's writes were rolled back.
    #[error("persistence error: {0:#}")]
    PersistenceError(anyhow::Error),

    /// A previous poll for the same stop is still in flight.
    #[error("skipped: previous poll for this stop is still running")]
    SkippedOverlap,

    /// The stop or camera is missing required configuration.
    #[error("configuration incomplete: {0}")]
    ConfigurationIncomplete(String),

    /// The task ran past its overall budget and its result was discarded.
    #[error("poll budget exceeded after {0:?}")]
    BudgetExceeded(Duration),

    /// The worker queue is full; the poll was not dispatched.
    #[error("worker pool saturated")]
    WorkerPoolSaturated,
}

impl PollError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PollError::CameraUnavailable(_) => FailureKind::CameraUnavailable,
            PollError::DecodeFailure(_) => FailureKind::DecodeFailure,
            PollError::DetectionProviderError(_) => FailureKind::DetectionProviderError,
            PollError::PersistenceError(_) => FailureKind::PersistenceError,
            PollError::SkippedOverlap => FailureKind::SkippedOverlap,
            PollError::ConfigurationIncomplete(_) => FailureKind::ConfigurationIncomplete,
            PollError::BudgetExceeded(_) => FailureKind::BudgetExceeded,
            PollError::WorkerPoolSaturated => FailureKind::WorkerPoolSaturated,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        PollError::ConfigurationIncomplete(message.into())
    }
}
