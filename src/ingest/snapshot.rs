//! HTTP snapshot source: every `read_frame` performs one GET.

use anyhow::{anyhow, Context};
use std::io::Read;

use super::{FrameRead, FrameReader, OpenOptions};
use crate::error::PollError;
use crate::frame::{Frame, MAX_JPEG_BYTES};

pub struct SnapshotReader {
    url: String,
    agent: ureq::Agent,
}

impl SnapshotReader {
    pub fn open(url: &str, options: &OpenOptions) -> Result<Self, PollError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(PollError::CameraUnavailable(anyhow!(
                "snapshot url must be http(s): {}",
                url
            )));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.open_timeout)
            .timeout_read(options.read_timeout)
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
        })
    }
}

impl FrameReader for SnapshotReader {
    fn read_frame(&mut self) -> Result<FrameRead, PollError> {
        let bytes = fetch_jpeg(&self.agent, &self.url)?;
        Frame::decode_jpeg(&bytes).map(FrameRead::Frame)
    }
}

/// Fetch one image body. Transport errors and non-2xx statuses are
/// `CameraUnavailable`; the body itself is checked by the decoder.
pub(crate) fn fetch_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, PollError> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch snapshot from {}", url))
        .map_err(PollError::CameraUnavailable)?;
    if !(200..300).contains(&response.status()) {
        return Err(PollError::CameraUnavailable(anyhow!(
            "snapshot {} returned status {}",
            url,
            response.status()
        )));
    }
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read snapshot body")
        .map_err(PollError::CameraUnavailable)?;
    Ok(bytes)
}
