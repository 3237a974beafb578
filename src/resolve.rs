//! Endpoint resolution with ordered fallback.
//!
//! `EndpointResolver` walks a camera's candidates in priority order, opens each
//! at most once and reads one frame. The first candidate that yields a decoded
//! frame wins; its open source and first frame are handed to the caller together
//! with the URL used, so a session can prefer the same URL when it reconnects.

use anyhow::anyhow;
use std::sync::Arc;

use crate::camera::{CameraRegistry, EndpointCandidate, QualityTier};
use crate::error::PollError;
use crate::frame::Frame;
use crate::ingest::{FrameRead, FrameSource, OpenOptions, SourceOpener};

/// What the caller needs the endpoint for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    /// One frame for a poll; only snapshot-capable candidates are tried.
    Snapshot,
    /// A live session; every candidate is tried, streams first.
    Stream,
}

/// One failed candidate, kept for diagnostics.
#[derive(Clone, Debug)]
pub struct CandidateFailure {
    pub url: String,
    pub reason: String,
}

/// A resolved endpoint: open source, its first frame, and the winning candidate.
pub struct Resolved {
    pub source: FrameSource,
    pub first_frame: Frame,
    pub candidate: EndpointCandidate,
    pub failures: Vec<CandidateFailure>,
}

impl Resolved {
    pub fn url(&self) -> &str {
        &self.candidate.url
    }
}

#[derive(Clone)]
pub struct EndpointResolver {
    registry: Arc<CameraRegistry>,
    opener: Arc<dyn SourceOpener>,
    options: OpenOptions,
}

impl EndpointResolver {
    pub fn new(
        registry: Arc<CameraRegistry>,
        opener: Arc<dyn SourceOpener>,
        options: OpenOptions,
    ) -> Self {
        Self {
            registry,
            opener,
            options,
        }
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    pub fn resolve_snapshot(&self, camera_id: &str) -> Result<Resolved, PollError> {
        self.resolve(camera_id, Purpose::Snapshot, None, None)
    }

    pub fn resolve_stream(
        &self,
        camera_id: &str,
        quality: Option<QualityTier>,
        preferred_url: Option<&str>,
    ) -> Result<Resolved, PollError> {
        self.resolve(camera_id, Purpose::Stream, quality, preferred_url)
    }

    /// Candidates in the order they will be tried.
    pub fn ordered_candidates(
        &self,
        camera_id: &str,
        purpose: Purpose,
        quality: Option<QualityTier>,
        preferred_url: Option<&str>,
    ) -> Result<Vec<EndpointCandidate>, PollError> {
        let endpoint = self.registry.lookup(camera_id)?;
        let mut candidates: Vec<EndpointCandidate> = endpoint
            .candidates
            .iter()
            .filter(|c| purpose == Purpose::Stream || c.protocol.serves_snapshot())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(PollError::configuration(format!(
                "camera '{}' has no {:?} candidates",
                camera_id, purpose
            )));
        }
        // Stable: ties keep registry order.
        candidates.sort_by_key(|c| {
            let preferred = preferred_url.is_some_and(|url| url == c.url);
            let quality_match = quality.is_some_and(|q| q == c.quality);
            (!preferred, !quality_match)
        });
        Ok(candidates)
    }

    pub fn resolve(
        &self,
        camera_id: &str,
        purpose: Purpose,
        quality: Option<QualityTier>,
        preferred_url: Option<&str>,
    ) -> Result<Resolved, PollError> {
        let candidates = self.ordered_candidates(camera_id, purpose, quality, preferred_url)?;
        let mut failures = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match self.try_candidate(&candidate) {
                Ok((source, first_frame)) => {
                    log::info!(
                        "resolved camera {} via {:?} {} after {} failed candidates",
                        camera_id,
                        candidate.protocol,
                        candidate.url,
                        failures.len()
                    );
                    return Ok(Resolved {
                        source,
                        first_frame,
                        candidate,
                        failures,
                    });
                }
                Err(err) => {
                    log::debug!("camera {} candidate {} failed: {}", camera_id, candidate.url, err);
                    failures.push(CandidateFailure {
                        url: candidate.url,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let summary = failures
            .iter()
            .map(|f| format!("{} ({})", f.url, f.reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(PollError::CameraUnavailable(anyhow!(
            "all {} candidates for camera '{}' failed: {}",
            failures.len(),
            camera_id,
            summary
        )))
    }

    fn try_candidate(&self, candidate: &EndpointCandidate) -> Result<(FrameSource, Frame), PollError> {
        let mut source = self.opener.open(candidate, &self.options)?;
        match source.next_frame()? {
            FrameRead::Frame(frame) if frame.width() > 0 && frame.height() > 0 => {
                Ok((source, frame))
            }
            FrameRead::Frame(_) => Err(PollError::DecodeFailure(anyhow!("empty frame"))),
            FrameRead::EndOfStream => Err(PollError::CameraUnavailable(anyhow!(
                "stream ended before first frame"
            ))),
        }
    }
}
