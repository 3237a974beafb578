//! Websocket front door for live relay sessions.
//!
//! One thread per client connection. The accept loop polls a nonblocking
//! listener so `RelayHandle::stop` can end it; running sessions observe the
//! relay's cancel flag at their next iteration.

use anyhow::{anyhow, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};

use super::channel::{RelayChannel, WsChannel};
use super::message::ServerMessage;
use super::rate::FpsMode;
use super::session::{LiveStreamRelay, SessionParams};
use crate::model::StopId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayRoute {
    /// `/live/{stop_id}`: relay the stop's camera.
    Live { stop_id: StopId, params: SessionParams },
    /// `/process`: process frames uploaded by the client.
    Upload {
        stop_id: Option<StopId>,
        params: SessionParams,
    },
}

/// Parse a websocket request target such as `/live/7?fpsMode=active`.
pub fn parse_route(target: &str) -> Result<RelayRoute> {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let mut with_detection = true;
    let mut fps_mode = None;
    let mut stop_param = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "withDetection" => {
                with_detection = !matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no")
            }
            "fpsMode" => fps_mode = Some(value.into_owned()),
            "stopId" => stop_param = Some(value.into_owned()),
            _ => {}
        }
    }
    let params = SessionParams {
        with_detection,
        fps_mode: FpsMode::parse(fps_mode.as_deref()),
    };

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["live", id] => Ok(RelayRoute::Live {
            stop_id: parse_stop_id(id)?,
            params,
        }),
        ["process"] => Ok(RelayRoute::Upload {
            stop_id: stop_param.as_deref().map(parse_stop_id).transpose()?,
            params,
        }),
        _ => Err(anyhow!("unknown relay route '{}'", path)),
    }
}

fn parse_stop_id(value: &str) -> Result<StopId> {
    value
        .trim()
        .parse::<StopId>()
        .map_err(|_| anyhow!("invalid stop id '{}'", value))
}

#[derive(Debug)]
pub struct RelayHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("relay server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct RelayServer {
    addr: String,
    relay: Arc<LiveStreamRelay>,
}

impl RelayServer {
    pub fn new(addr: impl Into<String>, relay: Arc<LiveStreamRelay>) -> Self {
        Self {
            addr: addr.into(),
            relay,
        }
    }

    pub fn spawn(self) -> Result<RelayHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cancel = self.relay.cancel_flag();
        let relay = self.relay;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_relay(listener, relay, shutdown_thread) {
                log::error!("relay server stopped: {}", err);
            }
        });
        log::info!("relay listening on ws://{}", addr);

        Ok(RelayHandle {
            addr,
            shutdown,
            cancel,
            join: Some(join),
        })
    }
}

fn run_relay(
    listener: TcpListener,
    relay: Arc<LiveStreamRelay>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let relay = relay.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("relay-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &relay) {
                            log::warn!("relay connection from {} rejected: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(handle) => sessions.push(handle),
                    Err(err) => log::error!("relay session thread not started: {}", err),
                }
                sessions.retain(|handle| !handle.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for handle in sessions {
        let _ = handle.join();
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, relay: &LiveStreamRelay) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return Err(anyhow!("non-loopback peer on loopback relay"));
    }
    stream.set_nonblocking(false)?;

    let target = Arc::new(Mutex::new(String::new()));
    let captured = target.clone();
    let socket = tungstenite::accept_hdr(stream, move |req: &Request, resp: Response| {
        if let Ok(mut slot) = captured.lock() {
            *slot = req.uri().to_string();
        }
        Ok::<Response, ErrorResponse>(resp)
    })
    .map_err(|e| anyhow!("websocket handshake failed: {}", e))?;
    let target = target
        .lock()
        .map(|slot| slot.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

    let mut channel = WsChannel::new(socket);
    let summary = match parse_route(&target) {
        Ok(RelayRoute::Live { stop_id, params }) => {
            relay.run_camera_session(stop_id, params, &mut channel)
        }
        Ok(RelayRoute::Upload { stop_id, params }) => {
            relay.run_upload_session(stop_id, params, &mut channel)
        }
        Err(err) => {
            let _ = channel.send_message(&ServerMessage::error(err.to_string()));
            let _ = channel.send_message(&ServerMessage::Closed {
                reason: "unknown route".to_string(),
            });
            channel.close();
            return Err(err);
        }
    };
    log::debug!(
        "relay {}: {} frames emitted, closed: {}",
        target,
        summary.frames_emitted,
        summary.close_reason
    );
    Ok(())
}
