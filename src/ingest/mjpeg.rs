//! HTTP MJPEG source.
//!
//! Connects once and splits the multipart body on JPEG SOI/EOI markers. A
//! response that is not multipart is treated as a single JPEG endpoint and
//! re-fetched on every read.

use anyhow::{anyhow, Context};
use std::io::{ErrorKind, Read};

use super::snapshot::fetch_jpeg;
use super::{FrameRead, FrameReader, OpenOptions};
use crate::error::PollError;
use crate::frame::{Frame, MAX_JPEG_BYTES};

pub struct MjpegReader {
    url: String,
    agent: ureq::Agent,
    stream: HttpStream,
}

enum HttpStream {
    Multipart(MjpegStream),
    SingleJpeg,
    Released,
}

impl MjpegReader {
    pub fn open(url: &str, options: &OpenOptions) -> Result<Self, PollError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.open_timeout)
            .timeout_read(options.read_timeout)
            .build();
        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", url))
            .map_err(PollError::CameraUnavailable)?;
        let content_type = response.header("Content-Type").unwrap_or("");
        let stream = if content_type.to_lowercase().contains("multipart") {
            HttpStream::Multipart(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        };
        log::info!("MjpegReader: connected to {}", url);
        Ok(Self {
            url: url.to_string(),
            agent,
            stream,
        })
    }
}

impl FrameReader for MjpegReader {
    fn read_frame(&mut self) -> Result<FrameRead, PollError> {
        let bytes = match &mut self.stream {
            HttpStream::Multipart(stream) => match stream.read_next_jpeg()? {
                Some(bytes) => bytes,
                None => return Ok(FrameRead::EndOfStream),
            },
            HttpStream::SingleJpeg => fetch_jpeg(&self.agent, &self.url)?,
            HttpStream::Released => return Ok(FrameRead::EndOfStream),
        };
        Frame::decode_jpeg(&bytes).map(FrameRead::Frame)
    }

    fn release(&mut self) {
        self.stream = HttpStream::Released;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` when the server closed the stream.
    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>, PollError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(PollError::CameraUnavailable(
                        anyhow!(err).context("read mjpeg chunk"),
                    ))
                }
            };
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
