//! Live-stream relay: per-connection sessions that read a camera (or client
//! uploads), gate the frame rate, detect, annotate and push frames plus
//! metadata back to the client.

pub mod channel;
pub mod message;
pub mod rate;
pub mod server;
pub mod session;

pub use channel::{Inbound, RelayChannel, WsChannel};
pub use message::ServerMessage;
pub use rate::{skip_factor, FpsMode, RateGate};
pub use server::{parse_route, RelayHandle, RelayRoute, RelayServer};
pub use session::{LiveStreamRelay, RelayConfig, SessionParams, SessionState, SessionSummary};
