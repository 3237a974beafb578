//! Per-connection live relay sessions.
//!
//! Each session runs `Connecting -> Streaming -> Closing` and owns its frame
//! source and smoothing window. Nothing is shared between sessions or with
//! the poll scheduler. Every exit path goes through `Closing`, which releases
//! the source, tells the client why, and closes the connection.

use anyhow::anyhow;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::channel::{Inbound, RelayChannel};
use super::message::ServerMessage;
use super::rate::{FpsMode, RateGate};
use crate::detect::{DetectionPolicy, DetectorBackend};
use crate::error::PollError;
use crate::frame::{Frame, BUS_COLOR, PERSON_COLOR, ZONE_COLOR};
use crate::ingest::FrameRead;
use crate::model::{ObservationCounts, Point, StopId};
use crate::resolve::EndpointResolver;
use crate::scheduler::StopDirectory;
use crate::smooth::DetectionSmoother;
use crate::zone::{ZoneFilter, ZoneMode};

/// How long an upload session waits for the next client frame per iteration.
const UPLOAD_WAIT: Duration = Duration::from_millis(250);
const BOX_THICKNESS: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Streaming,
    Closing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionParams {
    pub with_detection: bool,
    pub fps_mode: FpsMode,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            with_detection: true,
            fps_mode: FpsMode::Passive,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub stop_id: Option<StopId>,
    pub url: Option<String>,
    pub frames_read: u64,
    pub frames_emitted: u64,
    pub close_reason: String,
    pub final_state: SessionState,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub jpeg_quality: u8,
    pub zone_mode: ZoneMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            zone_mode: ZoneMode::BoundingBox,
        }
    }
}

pub struct LiveStreamRelay {
    resolver: EndpointResolver,
    detector: Arc<dyn DetectorBackend>,
    policy: DetectionPolicy,
    directory: Arc<dyn StopDirectory>,
    config: RelayConfig,
    cancel: Arc<AtomicBool>,
}

/// Session-owned state threaded through the streaming loop.
struct SessionContext {
    stop_id: Option<StopId>,
    params: SessionParams,
    zone: ZoneFilter,
    smoother: DetectionSmoother,
    gate: RateGate,
    state: SessionState,
    frames_read: u64,
    frames_emitted: u64,
}

impl LiveStreamRelay {
    pub fn new(
        resolver: EndpointResolver,
        detector: Arc<dyn DetectorBackend>,
        policy: DetectionPolicy,
        directory: Arc<dyn StopDirectory>,
        config: RelayConfig,
    ) -> Self {
        Self {
            resolver,
            detector,
            policy,
            directory,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sessions end at their next iteration once this flag is set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn stop_zone(&self, stop_id: StopId) -> Result<(Option<String>, Vec<Point>), PollError> {
        let stop = self
            .directory
            .get(stop_id)
            .map_err(|e| PollError::configuration(format!("stop directory unavailable: {:#}", e)))?
            .ok_or_else(|| PollError::configuration(format!("stop {} is not configured", stop_id)))?;
        let camera_id = stop
            .camera_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        Ok((camera_id, stop.zone))
    }

    /// Relay a stop's camera to the client until `stop`, disconnect, or a read failure.
    pub fn run_camera_session(
        &self,
        stop_id: StopId,
        params: SessionParams,
        channel: &mut dyn RelayChannel,
    ) -> SessionSummary {
        log::info!(
            "relay stop {}: connecting (detection={}, mode={})",
            stop_id,
            params.with_detection,
            params.fps_mode.as_str()
        );
        let resolved = self.stop_zone(stop_id).and_then(|(camera_id, zone)| {
            let camera_id = camera_id.ok_or_else(|| {
                PollError::configuration(format!("stop {} has no camera id", stop_id))
            })?;
            let resolved = self.resolver.resolve_stream(&camera_id, None, None)?;
            Ok((resolved, zone))
        });
        let (resolved, zone) = match resolved {
            Ok(found) => found,
            Err(err) => {
                return self.close_without_stream(Some(stop_id), channel, &err);
            }
        };
        let url = resolved.candidate.url.clone();
        let mut source = resolved.source;
        let mut pending = Some(resolved.first_frame);
        let snapshot_style = source.source_fps().is_none();

        let mut session = SessionContext {
            stop_id: Some(stop_id),
            params,
            zone: ZoneFilter::new(&zone, self.config.zone_mode),
            smoother: DetectionSmoother::new(),
            gate: RateGate::new(source.source_fps(), params.fps_mode),
            state: SessionState::Connecting,
            frames_read: 0,
            frames_emitted: 0,
        };

        let connected = ServerMessage::Connected {
            stop_id: Some(stop_id),
            url: url.clone(),
            fps_mode: params.fps_mode.as_str().to_string(),
            target_fps: params.fps_mode.target_fps(),
            skip_factor: session.gate.skip(),
        };
        let reason = match channel.send_message(&connected) {
            Ok(()) => {
                session.state = SessionState::Streaming;
                log::info!("relay stop {}: streaming from {}", stop_id, url);
                self.stream_camera(&mut session, &mut source, &mut pending, snapshot_style, channel)
            }
            Err(err) => format!("client unreachable: {:#}", err),
        };

        session.state = SessionState::Closing;
        source.close();
        self.finish(session, Some(url), reason, channel)
    }

    fn stream_camera(
        &self,
        session: &mut SessionContext,
        source: &mut crate::ingest::FrameSource,
        pending: &mut Option<Frame>,
        snapshot_style: bool,
        channel: &mut dyn RelayChannel,
    ) -> String {
        loop {
            if self.cancelled() {
                return "server shutting down".to_string();
            }
            // Snapshot sources are fetched on demand, so wait out the gate here
            // instead of fetching frames that would be dropped.
            let wait = if snapshot_style && pending.is_none() {
                session.gate.remaining(Instant::now())
            } else {
                Duration::ZERO
            };
            match channel.poll_inbound(wait) {
                Ok(Inbound::Stop) => return "client requested stop".to_string(),
                Ok(Inbound::Closed) => return "client disconnected".to_string(),
                Ok(Inbound::Idle) | Ok(Inbound::Frame(_)) => {}
                Err(err) => return format!("client error: {:#}", err),
            }

            let frame = match pending.take() {
                Some(frame) => frame,
                None => match source.next_frame() {
                    Ok(FrameRead::Frame(frame)) => frame,
                    Ok(FrameRead::EndOfStream) => {
                        let _ = channel.send_message(&ServerMessage::error("stream ended"));
                        return "end of stream".to_string();
                    }
                    Err(err) => {
                        let _ = channel.send_message(&ServerMessage::error(err.to_string()));
                        return format!("read failed: {}", err.kind());
                    }
                },
            };
            session.frames_read += 1;

            if !session.gate.admit(Instant::now()) {
                continue;
            }
            if let Err(reason) = self.emit(session, frame, channel) {
                return reason;
            }
        }
    }

    /// Process JPEG frames uploaded by the client and answer each emitted one.
    pub fn run_upload_session(
        &self,
        stop_id: Option<StopId>,
        params: SessionParams,
        channel: &mut dyn RelayChannel,
    ) -> SessionSummary {
        let zone = match stop_id.map(|id| self.stop_zone(id)).transpose() {
            Ok(found) => found.map(|(_, zone)| zone).unwrap_or_default(),
            Err(err) => return self.close_without_stream(stop_id, channel, &err),
        };
        let mut session = SessionContext {
            stop_id,
            params,
            zone: ZoneFilter::new(&zone, self.config.zone_mode),
            smoother: DetectionSmoother::new(),
            gate: RateGate::new(None, params.fps_mode),
            state: SessionState::Connecting,
            frames_read: 0,
            frames_emitted: 0,
        };
        let connected = ServerMessage::Connected {
            stop_id,
            url: "upload".to_string(),
            fps_mode: params.fps_mode.as_str().to_string(),
            target_fps: params.fps_mode.target_fps(),
            skip_factor: session.gate.skip(),
        };
        let reason = match channel.send_message(&connected) {
            Ok(()) => {
                session.state = SessionState::Streaming;
                self.stream_uploads(&mut session, channel)
            }
            Err(err) => format!("client unreachable: {:#}", err),
        };
        session.state = SessionState::Closing;
        self.finish(session, None, reason, channel)
    }

    fn stream_uploads(&self, session: &mut SessionContext, channel: &mut dyn RelayChannel) -> String {
        loop {
            if self.cancelled() {
                return "server shutting down".to_string();
            }
            let bytes = match channel.poll_inbound(UPLOAD_WAIT) {
                Ok(Inbound::Frame(bytes)) => bytes,
                Ok(Inbound::Idle) => continue,
                Ok(Inbound::Stop) => return "client requested stop".to_string(),
                Ok(Inbound::Closed) => return "client disconnected".to_string(),
                Err(err) => return format!("client error: {:#}", err),
            };
            session.frames_read += 1;
            if !session.gate.admit(Instant::now()) {
                continue;
            }
            let frame = match Frame::decode_jpeg(&bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    if channel.send_message(&ServerMessage::error(err.to_string())).is_err() {
                        return "client unreachable".to_string();
                    }
                    continue;
                }
            };
            if let Err(reason) = self.emit(session, frame, channel) {
                return reason;
            }
        }
    }

    /// Detect, annotate, encode and send one frame plus its metadata.
    /// Detection failures are reported to the client and the frame is skipped;
    /// only a failed send ends the session.
    fn emit(
        &self,
        session: &mut SessionContext,
        frame: Frame,
        channel: &mut dyn RelayChannel,
    ) -> Result<(), String> {
        let frame_number = session.frames_read;
        let (jpeg, message) = match self.process(session, frame, frame_number) {
            Ok(processed) => processed,
            Err(err) => {
                log::warn!(
                    "relay stop {:?}: frame {} skipped: {}",
                    session.stop_id,
                    frame_number,
                    err
                );
                return channel
                    .send_message(&ServerMessage::error(err.to_string()))
                    .map_err(|e| format!("client unreachable: {:#}", e));
            }
        };
        channel
            .send_frame(jpeg)
            .and_then(|()| channel.send_message(&message))
            .map_err(|e| format!("client unreachable: {:#}", e))?;
        session.frames_emitted += 1;
        Ok(())
    }

    fn process(
        &self,
        session: &mut SessionContext,
        mut frame: Frame,
        frame_number: u64,
    ) -> Result<(Vec<u8>, ServerMessage), PollError> {
        let (raw, smoothed) = if session.params.with_detection {
            let objects = self
                .detector
                .detect(&frame)
                .map_err(PollError::DetectionProviderError)?;
            let sample = self.policy.apply(objects, frame.width(), frame.height());
            let people = session.zone.filter(&sample.people);
            let raw = ObservationCounts {
                people: people.len() as u32,
                buses: sample.buses.len() as u32,
            };
            let smoothed = session.smoother.observe(raw);

            if let Some(rect) = session.zone.rect() {
                frame.draw_box(&rect, ZONE_COLOR, BOX_THICKNESS);
            }
            for person in &people {
                frame.draw_box(&person.bbox, PERSON_COLOR, BOX_THICKNESS);
            }
            for bus in &sample.buses {
                frame.draw_box(&bus.bbox, BUS_COLOR, BOX_THICKNESS);
            }
            (raw, smoothed)
        } else {
            (ObservationCounts::default(), ObservationCounts::default())
        };
        let jpeg = frame
            .encode_jpeg(self.config.jpeg_quality)
            .map_err(|e| PollError::DecodeFailure(anyhow!("encode relay frame: {:#}", e)))?;
        Ok((jpeg, ServerMessage::metadata(frame_number, raw, smoothed)))
    }

    fn close_without_stream(
        &self,
        stop_id: Option<StopId>,
        channel: &mut dyn RelayChannel,
        err: &PollError,
    ) -> SessionSummary {
        log::warn!("relay stop {:?}: {}", stop_id, err);
        let reason = err.kind().to_string();
        let _ = channel.send_message(&ServerMessage::error(err.to_string()));
        let _ = channel.send_message(&ServerMessage::Closed {
            reason: reason.clone(),
        });
        channel.close();
        SessionSummary {
            stop_id,
            url: None,
            frames_read: 0,
            frames_emitted: 0,
            close_reason: reason,
            final_state: SessionState::Closing,
        }
    }

    fn finish(
        &self,
        session: SessionContext,
        url: Option<String>,
        reason: String,
        channel: &mut dyn RelayChannel,
    ) -> SessionSummary {
        let _ = channel.send_message(&ServerMessage::Closed {
            reason: reason.clone(),
        });
        channel.close();
        log::info!(
            "relay stop {:?}: closed ({}) after {} frames read, {} emitted",
            session.stop_id,
            reason,
            session.frames_read,
            session.frames_emitted
        );
        SessionSummary {
            stop_id: session.stop_id,
            url,
            frames_read: session.frames_read,
            frames_emitted: session.frames_emitted,
            close_reason: reason,
            final_state: session.state,
        }
    }
}
