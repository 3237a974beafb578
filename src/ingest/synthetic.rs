//! Synthetic `stub://` source.
//!
//! URL form: `stub://<name>?fps=25&frames=100&width=640&height=480`.
//! `frames` bounds the stream (unbounded when absent); `fps` is reported as the
//! native rate but frames are produced as fast as they are read.

use anyhow::{anyhow, Context};
use url::Url;

use super::{FrameRead, FrameReader};
use crate::error::PollError;
use crate::frame::Frame;

pub struct SyntheticReader {
    width: u32,
    height: u32,
    fps: f32,
    limit: Option<u64>,
    produced: u64,
}

impl SyntheticReader {
    pub fn open(url: &str) -> Result<Self, PollError> {
        let parsed = Url::parse(url)
            .with_context(|| format!("parse stub url {}", url))
            .map_err(PollError::CameraUnavailable)?;
        if parsed.scheme() != "stub" {
            return Err(PollError::CameraUnavailable(anyhow!(
                "synthetic source requires stub:// url, got {}",
                url
            )));
        }
        let mut reader = Self {
            width: 640,
            height: 480,
            fps: 25.0,
            limit: None,
            produced: 0,
        };
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "fps" => reader.fps = parse_param(&key, &value)?,
                "frames" => reader.limit = Some(parse_param(&key, &value)?),
                "width" => reader.width = parse_param(&key, &value)?,
                "height" => reader.height = parse_param(&key, &value)?,
                _ => {}
            }
        }
        if reader.width == 0 || reader.height == 0 || reader.fps <= 0.0 {
            return Err(PollError::configuration(format!(
                "stub source {} needs positive size and fps",
                url
            )));
        }
        log::info!("SyntheticReader: connected to {} (synthetic)", url);
        Ok(reader)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PollError> {
    value
        .parse()
        .map_err(|_| PollError::configuration(format!("invalid stub parameter {}={}", key, value)))
}

impl FrameReader for SyntheticReader {
    fn read_frame(&mut self) -> Result<FrameRead, PollError> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(FrameRead::EndOfStream);
        }
        self.produced += 1;
        let shade = (self.produced % 256) as u8;
        Ok(FrameRead::Frame(Frame::filled(
            self.width,
            self.height,
            [shade, 96, 128],
        )))
    }

    fn source_fps(&self) -> Option<f32> {
        Some(self.fps)
    }
}
