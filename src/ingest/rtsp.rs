//! RTSP / HLS stream source backed by GStreamer.
//!
//! Pipelines:
//! - RTSP: `rtspsrc ! decodebin ! videoconvert ! appsink`
//! - HLS:  `souphttpsrc ! hlsdemux ! decodebin ! videoconvert ! appsink`
//!
//! The appsink keeps one buffer and drops stale ones, so a slow consumer always
//! sees the most recent frame.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::RgbImage;
use std::time::Duration;

use super::{FrameRead, FrameReader, OpenOptions};
use crate::camera::Protocol;
use crate::error::PollError;
use crate::frame::Frame;

pub struct PipelineReader {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
    fps: Option<f32>,
    released: bool,
}

impl PipelineReader {
    pub fn open(url: &str, protocol: Protocol, options: &OpenOptions) -> Result<Self, PollError> {
        let mut reader = Self::build(url, protocol, options).map_err(PollError::CameraUnavailable)?;
        reader.start(options.open_timeout)?;
        Ok(reader)
    }

    fn build(url: &str, protocol: Protocol, options: &OpenOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let timeout_us = options.open_timeout.as_micros();
        let head = match protocol {
            Protocol::Rtsp => format!(
                "rtspsrc location=\"{}\" latency=0 protocols=tcp timeout={}",
                url, timeout_us
            ),
            Protocol::Hls => format!("souphttpsrc location=\"{}\" ! hlsdemux", url),
            other => return Err(anyhow!("{:?} is not a pipeline protocol", other)),
        };
        let description = format!(
            "{} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            head
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            read_timeout: options.read_timeout,
            fps: None,
            released: false,
        })
    }

    fn start(&mut self, open_timeout: Duration) -> Result<(), PollError> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")
            .map_err(PollError::CameraUnavailable)?;
        let (result, _, _) = self
            .pipeline
            .state(gstreamer::ClockTime::from_mseconds(open_timeout.as_millis() as u64));
        if result.is_err() {
            self.shutdown();
            return Err(PollError::CameraUnavailable(anyhow!(
                "stream {} did not start within {:?}",
                self.url,
                open_timeout
            )));
        }
        log::info!("PipelineReader: connected to {}", self.url);
        Ok(())
    }

    fn poll_bus(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Some("eos".to_string()),
                _ => {}
            }
        }
        None
    }

    fn shutdown(&mut self) {
        if !self.released {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            self.released = true;
        }
    }
}

impl FrameReader for PipelineReader {
    fn read_frame(&mut self) -> Result<FrameRead, PollError> {
        match self.poll_bus().as_deref() {
            Some("eos") => return Ok(FrameRead::EndOfStream),
            Some(error) => return Err(PollError::CameraUnavailable(anyhow!("{}", error))),
            None => {}
        }
        if self.appsink.is_eos() {
            return Ok(FrameRead::EndOfStream);
        }
        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = self.appsink.try_pull_sample(timeout).ok_or_else(|| {
            PollError::CameraUnavailable(anyhow!(
                "stream {} stalled for {:?}",
                self.url,
                self.read_timeout
            ))
        })?;
        let (frame, fps) = sample_to_frame(&sample).map_err(PollError::DecodeFailure)?;
        if fps.is_some() {
            self.fps = fps;
        }
        Ok(FrameRead::Frame(frame))
    }

    fn source_fps(&self) -> Option<f32> {
        self.fps
    }

    fn release(&mut self) {
        self.shutdown();
    }
}

impl Drop for PipelineReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<(Frame, Option<f32>)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;
    let fps = info.fps();
    let fps = (fps.denom() > 0 && fps.numer() > 0).then(|| fps.numer() as f32 / fps.denom() as f32);

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("buffer shorter than frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("buffer row is out of bounds")?,
            );
        }
        pixels
    };

    let image = RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
    Ok((Frame::from_rgb(image), fps))
}
