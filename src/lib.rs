//! Transit Stop Monitor
//!
//! Camera ingestion and monitoring pipeline for public-transport stops.
//!
//! # Architecture
//!
//! The monitor runs two independent loops over the same camera contracts:
//!
//! 1. **Periodic polling**: the `PollingScheduler` fans one `SnapshotPollTask`
//!    per eligible stop out over a bounded worker pool. Each task resolves an
//!    endpoint, fetches one frame, detects, zone-filters and persists one
//!    `LoadRecord` plus its `BusSighting`s.
//! 2. **Live relay**: one `LiveStreamRelay` session per websocket client reads
//!    a camera (or client uploads), gates the frame rate, detects, annotates
//!    and pushes frames with smoothed counts.
//!
//! A failure at any stage of one stop becomes a `PollOutcome::Failure` for that
//! stop. It never stalls the scheduler or another stop.
//!
//! # Module Structure
//!
//! - `camera`, `resolve`: typed endpoint registry and ordered fallback
//! - `ingest`, `frame`: scoped frame sources and decoded frames
//! - `detect`, `zone`, `smooth`: consumed detection capability and its filters
//! - `task`, `worker`, `scheduler`: polling
//! - `relay`: live sessions and their websocket server
//! - `storage`, `forecast`, `api`: persistence and the thin HTTP surface

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod camera;
pub mod config;
pub mod detect;
pub mod error;
pub mod forecast;
pub mod frame;
pub mod ingest;
pub mod model;
pub mod relay;
pub mod resolve;
pub mod runtime;
pub mod scheduler;
pub mod smooth;
pub mod storage;
pub mod task;
pub mod worker;
pub mod zone;

pub use camera::{CameraEndpoint, CameraRegistry, EndpointCandidate, Protocol, QualityTier};
pub use config::MonitorConfig;
pub use error::{FailureKind, PollError};
pub use frame::Frame;
pub use ingest::{FrameRead, FrameSource, NetworkOpener, OpenOptions, SourceOpener};
pub use model::{
    BoundingBox, BusSighting, LoadRecord, ObservationCounts, Point, PollOutcome, Stop, StopId,
};
pub use relay::{LiveStreamRelay, RelayServer};
pub use resolve::EndpointResolver;
pub use runtime::Monitor;
pub use scheduler::{PollingScheduler, StaticStopDirectory, StopDirectory};
pub use smooth::DetectionSmoother;
pub use storage::{InMemoryResultStore, ResultStore, ResultWriter, SqliteStoreFactory};
pub use task::{PollContext, SnapshotPollTask};
pub use zone::{ZoneFilter, ZoneMode};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
