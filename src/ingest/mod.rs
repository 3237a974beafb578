//! Frame ingestion sources.
//!
//! This module provides the sources a camera endpoint can be read through:
//! - HTTP snapshots (one fetch per frame)
//! - HTTP MJPEG streams
//! - RTSP / HLS streams (feature: rtsp-gstreamer)
//! - Synthetic `stub://` source (testing)
//!
//! Every open source is wrapped in a `FrameSource`, which owns the underlying
//! handle and releases it exactly once: on `close()`, on drop, or when the
//! reader reports end of stream. Sources are opened through the `SourceOpener`
//! seam so the resolver and relay never depend on a concrete transport.

mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
mod rtsp;
mod snapshot;
mod synthetic;

use anyhow::anyhow;
use std::time::Duration;

use crate::camera::{EndpointCandidate, Protocol};
use crate::error::PollError;
use crate::frame::Frame;

pub use mjpeg::MjpegReader;
pub use snapshot::SnapshotReader;
pub use synthetic::SyntheticReader;

/// Result of one read from a source.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    EndOfStream,
}

/// One open media handle. Implementations block for at most their read timeout.
pub trait FrameReader: Send {
    fn read_frame(&mut self) -> Result<FrameRead, PollError>;

    /// Native frame rate, when the transport reports one.
    fn source_fps(&self) -> Option<f32> {
        None
    }

    /// Release the underlying handle. Called at most once.
    fn release(&mut self) {}
}

/// Timeouts applied when opening and reading a candidate.
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions {
    pub open_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_millis(1_000),
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// Scoped frame source.
pub struct FrameSource {
    url: String,
    protocol: Protocol,
    reader: Option<Box<dyn FrameReader>>,
    frames_read: u64,
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_read: u64,
    pub url: String,
    pub open: bool,
}

impl FrameSource {
    pub fn new(url: impl Into<String>, protocol: Protocol, reader: Box<dyn FrameReader>) -> Self {
        Self {
            url: url.into(),
            protocol,
            reader: Some(reader),
            frames_read: 0,
        }
    }

    /// Read the next frame.
    ///
    /// A snapshot source performs one fetch; a stream source performs one read
    /// from its open connection. End of stream and read errors release the
    /// handle before returning.
    pub fn next_frame(&mut self) -> Result<FrameRead, PollError> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            PollError::CameraUnavailable(anyhow!("frame source {} is closed", self.url))
        })?;
        match reader.read_frame() {
            Ok(FrameRead::Frame(frame)) => {
                self.frames_read += 1;
                Ok(FrameRead::Frame(frame))
            }
            Ok(FrameRead::EndOfStream) => {
                self.close();
                Ok(FrameRead::EndOfStream)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    pub fn source_fps(&self) -> Option<f32> {
        self.reader.as_ref().and_then(|r| r.source_fps())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frames_read,
            url: self.url.clone(),
            open: self.is_open(),
        }
    }

    /// Release the underlying handle. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.release();
            log::debug!(
                "FrameSource: released {} after {} frames",
                self.url,
                self.frames_read
            );
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSource")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("open", &self.is_open())
            .field("frames_read", &self.frames_read)
            .finish()
    }
}

/// Opens a candidate endpoint into a `FrameSource`.
pub trait SourceOpener: Send + Sync {
    fn open(
        &self,
        candidate: &EndpointCandidate,
        options: &OpenOptions,
    ) -> Result<FrameSource, PollError>;
}

/// Opener dispatching on the candidate's protocol to the network backends.
#[derive(Clone, Debug, Default)]
pub struct NetworkOpener;

impl SourceOpener for NetworkOpener {
    fn open(
        &self,
        candidate: &EndpointCandidate,
        options: &OpenOptions,
    ) -> Result<FrameSource, PollError> {
        let reader: Box<dyn FrameReader> = match candidate.protocol {
            Protocol::Stub => Box::new(SyntheticReader::open(&candidate.url)?),
            Protocol::Snapshot => Box::new(SnapshotReader::open(&candidate.url, options)?),
            Protocol::Mjpeg => Box::new(MjpegReader::open(&candidate.url, options)?),
            Protocol::Rtsp | Protocol::Hls => open_pipeline(candidate, options)?,
        };
        Ok(FrameSource::new(
            candidate.url.clone(),
            candidate.protocol,
            reader,
        ))
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_pipeline(
    candidate: &EndpointCandidate,
    options: &OpenOptions,
) -> Result<Box<dyn FrameReader>, PollError> {
    Ok(Box::new(rtsp::PipelineReader::open(
        &candidate.url,
        candidate.protocol,
        options,
    )?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_pipeline(
    candidate: &EndpointCandidate,
    _options: &OpenOptions,
) -> Result<Box<dyn FrameReader>, PollError> {
    Err(PollError::CameraUnavailable(anyhow!(
        "{:?} endpoint {} requires the rtsp-gstreamer feature",
        candidate.protocol,
        candidate.url
    )))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
