mod common;

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use common::{person_at, rect_zone, stop, stub_registry};
use stop_monitor::detect::{DetectionPolicy, DetectorBackend, StubBackend};
use stop_monitor::ingest::{NetworkOpener, OpenOptions};
use stop_monitor::relay::{
    FpsMode, Inbound, LiveStreamRelay, RelayChannel, RelayConfig, ServerMessage, SessionParams,
    SessionState,
};
use stop_monitor::{EndpointResolver, Frame, StaticStopDirectory};

/// Channel that replays scripted client input and records server output.
#[derive(Default)]
struct RecordingChannel {
    inbound: VecDeque<Inbound>,
    /// Inbound returned once the script is exhausted.
    after_script: Option<Inbound>,
    frames: Vec<Vec<u8>>,
    messages: Vec<ServerMessage>,
    fail_sends_after: Option<usize>,
    /// Answer `Stop` once this many metadata messages were sent.
    stop_after_metadata: Option<usize>,
    /// Simulated wait per poll.
    pace: Option<Duration>,
    closed: bool,
}

impl RecordingChannel {
    fn scripted(inbound: Vec<Inbound>) -> Self {
        Self {
            inbound: inbound.into(),
            ..Self::default()
        }
    }

    fn metadata(&self) -> Vec<(u32, u64)> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Metadata {
                    people_count,
                    frame_number,
                    ..
                } => Some((*people_count, *frame_number)),
                _ => None,
            })
            .collect()
    }

    fn last(&self) -> Option<&ServerMessage> {
        self.messages.last()
    }
}

impl RelayChannel for RecordingChannel {
    fn send_frame(&mut self, jpeg: Vec<u8>) -> Result<()> {
        if self.fail_sends_after.is_some_and(|n| self.frames.len() >= n) {
            return Err(anyhow!("broken pipe"));
        }
        self.frames.push(jpeg);
        Ok(())
    }

    fn send_message(&mut self, message: &ServerMessage) -> Result<()> {
        self.messages.push(message.clone());
        Ok(())
    }

    fn poll_inbound(&mut self, _wait: Duration) -> Result<Inbound> {
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        if self
            .stop_after_metadata
            .is_some_and(|n| self.metadata().len() >= n)
        {
            return Ok(Inbound::Stop);
        }
        match self.inbound.pop_front() {
            Some(next) => Ok(next),
            None => match &self.after_script {
                Some(Inbound::Stop) => Ok(Inbound::Stop),
                Some(Inbound::Closed) => Ok(Inbound::Closed),
                _ => Ok(Inbound::Idle),
            },
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn relay(camera_url_frames: Option<u32>, detector: Arc<dyn DetectorBackend>) -> LiveStreamRelay {
    let registry = match camera_url_frames {
        Some(frames) => {
            let endpoints = vec![stop_monitor::CameraEndpoint {
                camera_id: "cam".to_string(),
                name: None,
                candidates: vec![stop_monitor::EndpointCandidate::new(
                    stop_monitor::Protocol::Stub,
                    stop_monitor::QualityTier::Standard,
                    format!("stub://cam?width=320&height=240&fps=25&frames={frames}"),
                )],
            }];
            match stop_monitor::CameraRegistry::new(endpoints) {
                Ok(registry) => Arc::new(registry),
                Err(err) => panic!("registry: {err:#}"),
            }
        }
        None => stub_registry(&["cam"], 320, 240),
    };
    let resolver = EndpointResolver::new(registry, Arc::new(NetworkOpener), OpenOptions::default());
    let directory = Arc::new(StaticStopDirectory::new(vec![
        stop(1, Some("cam"), rect_zone(0.0, 0.0, 160.0, 240.0), true),
        stop(2, Some("missing"), rect_zone(0.0, 0.0, 160.0, 240.0), true),
    ]));
    LiveStreamRelay::new(
        resolver,
        detector,
        DetectionPolicy::default(),
        directory,
        RelayConfig::default(),
    )
}

fn two_people() -> Arc<dyn DetectorBackend> {
    // One inside the zone (left half), one outside.
    Arc::new(StubBackend::new(vec![person_at(50.0, 100.0), person_at(250.0, 100.0)]))
}

#[test]
fn camera_session_streams_until_stop() -> Result<()> {
    let relay = relay(None, two_people());
    let mut channel = RecordingChannel::scripted(vec![Inbound::Idle, Inbound::Idle]);
    channel.after_script = Some(Inbound::Stop);
    let params = SessionParams {
        with_detection: true,
        fps_mode: FpsMode::Active,
    };

    let summary = relay.run_camera_session(1, params, &mut channel);
    assert_eq!(summary.close_reason, "client requested stop");
    assert_eq!(summary.final_state, SessionState::Closing);
    assert!(channel.closed);

    match channel.messages.first() {
        Some(ServerMessage::Connected {
            stop_id,
            fps_mode,
            skip_factor,
            ..
        }) => {
            assert_eq!(*stop_id, Some(1));
            assert_eq!(fps_mode, "active");
            assert_eq!(*skip_factor, 3);
        }
        other => panic!("expected connected first, got {other:?}"),
    }
    let metadata = channel.metadata();
    assert!(!metadata.is_empty());
    assert_eq!(metadata[0], (1, 1));
    assert_eq!(channel.frames.len(), metadata.len());
    let annotated = Frame::decode_jpeg(&channel.frames[0])?;
    assert_eq!((annotated.width(), annotated.height()), (320, 240));
    assert!(matches!(channel.last(), Some(ServerMessage::Closed { .. })));
    Ok(())
}

#[test]
fn end_of_stream_is_reported_before_close() -> Result<()> {
    let relay = relay(Some(1), two_people());
    let mut channel = RecordingChannel::default();

    let summary = relay.run_camera_session(1, SessionParams::default(), &mut channel);
    assert_eq!(summary.close_reason, "end of stream");
    assert_eq!(summary.frames_read, 1);
    let n = channel.messages.len();
    assert!(n >= 3);
    assert!(matches!(channel.messages[n - 2], ServerMessage::Error { .. }));
    assert!(matches!(channel.messages[n - 1], ServerMessage::Closed { .. }));
    Ok(())
}

#[test]
fn unknown_camera_closes_with_error() -> Result<()> {
    let relay = relay(None, two_people());
    let mut channel = RecordingChannel::default();

    let summary = relay.run_camera_session(2, SessionParams::default(), &mut channel);
    assert_eq!(summary.close_reason, "configuration_incomplete");
    assert_eq!(summary.frames_emitted, 0);
    assert!(matches!(channel.messages[0], ServerMessage::Error { .. }));
    assert!(matches!(channel.messages[1], ServerMessage::Closed { .. }));
    assert!(channel.closed);
    Ok(())
}

#[test]
fn without_detection_counts_are_zero() -> Result<()> {
    let relay = relay(None, two_people());
    let mut channel = RecordingChannel::scripted(vec![Inbound::Idle]);
    channel.after_script = Some(Inbound::Closed);
    let params = SessionParams {
        with_detection: false,
        fps_mode: FpsMode::Passive,
    };

    let summary = relay.run_camera_session(1, params, &mut channel);
    assert_eq!(summary.close_reason, "client disconnected");
    assert_eq!(channel.metadata(), vec![(0, 1)]);
    Ok(())
}

#[test]
fn failed_send_ends_session() -> Result<()> {
    let relay = relay(None, two_people());
    let mut channel = RecordingChannel::default();
    channel.fail_sends_after = Some(0);

    let summary = relay.run_camera_session(1, SessionParams::default(), &mut channel);
    assert!(summary.close_reason.starts_with("client unreachable"));
    assert_eq!(summary.frames_emitted, 0);
    assert!(channel.closed);
    Ok(())
}

#[test]
fn upload_session_processes_client_frames() -> Result<()> {
    let relay = relay(None, two_people());
    let jpeg = Frame::filled(320, 240, [10, 20, 30]).encode_jpeg(80)?;
    let mut channel = RecordingChannel::scripted(vec![Inbound::Idle, Inbound::Frame(jpeg), Inbound::Stop]);

    let summary = relay.run_upload_session(Some(1), SessionParams::default(), &mut channel);
    assert_eq!(summary.close_reason, "client requested stop");
    assert_eq!(summary.frames_read, 1);
    assert_eq!(channel.metadata(), vec![(1, 1)]);
    assert_eq!(channel.frames.len(), 1);
    match channel.messages.first() {
        Some(ServerMessage::Connected { stop_id, url, .. }) => {
            assert_eq!(*stop_id, Some(1));
            assert_eq!(url, "upload");
        }
        other => panic!("expected connected first, got {other:?}"),
    }
    Ok(())
}

#[test]
fn undecodable_upload_is_reported_and_session_continues() -> Result<()> {
    let relay = relay(None, two_people());
    let mut channel = RecordingChannel::scripted(vec![
        Inbound::Frame(b"not a jpeg".to_vec()),
        Inbound::Idle,
        Inbound::Stop,
    ]);

    let summary = relay.run_upload_session(None, SessionParams::default(), &mut channel);
    assert_eq!(summary.close_reason, "client requested stop");
    assert_eq!(summary.frames_emitted, 0);
    let errors = channel
        .messages
        .iter()
        .filter(|m| matches!(m, ServerMessage::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert!(matches!(channel.last(), Some(ServerMessage::Closed { .. })));
    Ok(())
}

#[test]
fn sessions_do_not_share_smoothing_state() -> Result<()> {
    let crowd = vec![person_at(30.0, 50.0), person_at(60.0, 100.0), person_at(90.0, 150.0)];
    let detector = Arc::new(StubBackend::scripted(vec![crowd.clone(), crowd], Vec::new()));
    let relay = relay(None, detector);
    let params = SessionParams {
        with_detection: true,
        fps_mode: FpsMode::Active,
    };

    let mut first = RecordingChannel {
        pace: Some(Duration::from_millis(50)),
        stop_after_metadata: Some(2),
        ..RecordingChannel::default()
    };
    relay.run_camera_session(1, params, &mut first);
    assert_eq!(first.metadata().iter().map(|m| m.0).collect::<Vec<_>>(), vec![3, 3]);

    // A fresh session starts from an empty window: an empty scene reads 0,
    // where a window still holding [3, 3] would report 3.
    let mut second = RecordingChannel {
        stop_after_metadata: Some(1),
        ..RecordingChannel::default()
    };
    relay.run_camera_session(1, params, &mut second);
    assert_eq!(second.metadata()[0].0, 0);
    Ok(())
}
