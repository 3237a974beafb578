//! Duplex connection to one relay client.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::{Message, WebSocket};

use super::message::ServerMessage;

/// What the client sent, if anything, within the wait.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Idle,
    Stop,
    Frame(Vec<u8>),
    Closed,
}

pub trait RelayChannel {
    fn send_frame(&mut self, jpeg: Vec<u8>) -> Result<()>;

    fn send_message(&mut self, message: &ServerMessage) -> Result<()>;

    /// Wait up to `wait` for client input. Doubles as the cancellable sleep
    /// between rate-gated frames.
    fn poll_inbound(&mut self, wait: Duration) -> Result<Inbound>;

    fn close(&mut self);
}

const MIN_WAIT: Duration = Duration::from_millis(1);

pub struct WsChannel {
    socket: WebSocket<TcpStream>,
    closed: bool,
}

impl WsChannel {
    pub fn new(socket: WebSocket<TcpStream>) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

impl RelayChannel for WsChannel {
    fn send_frame(&mut self, jpeg: Vec<u8>) -> Result<()> {
        self.socket
            .send(Message::Binary(jpeg))
            .context("send frame")
    }

    fn send_message(&mut self, message: &ServerMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.socket.send(Message::Text(text)).context("send message")
    }

    fn poll_inbound(&mut self, wait: Duration) -> Result<Inbound> {
        if self.closed {
            return Ok(Inbound::Closed);
        }
        self.socket
            .get_mut()
            .set_read_timeout(Some(wait.max(MIN_WAIT)))
            .context("set relay read timeout")?;
        match self.socket.read() {
            Ok(Message::Text(text)) if text.trim().eq_ignore_ascii_case("stop") => Ok(Inbound::Stop),
            Ok(Message::Text(_)) => Ok(Inbound::Idle),
            Ok(Message::Binary(data)) => Ok(Inbound::Frame(data)),
            Ok(Message::Close(_)) => {
                self.closed = true;
                Ok(Inbound::Closed)
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Ok(Inbound::Idle),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(Inbound::Idle)
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                self.closed = true;
                Ok(Inbound::Closed)
            }
            Err(err) => Err(err).context("read from relay client"),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}
