//! Typed camera registry.
//!
//! Maps a camera id to its ordered endpoint candidates, highest fidelity first.
//! The registry is static configuration: built once from the config file (or
//! the built-in table) and only read afterwards.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PollError;

const IS74_RTSP_BASE: &str = "rtsp://cdn.cams.is74.ru:8554/stream";
const IS74_HLS_BASE: &str = "https://cdn.cams.is74.ru/hls/playlists/multivariant.m3u8";
const IS74_SNAPSHOT_BASE: &str = "https://cdn.cams.is74.ru/snapshot";

/// (camera id, display name, stream uuid)
const BUILTIN_CAMERAS: &[(&str, &str, &str)] = &[
    (
        "camera1",
        "Чичерина - Братьев Кашириных",
        "1f3563e8-d978-4caf-a0bc-b1932aa99ba4",
    ),
    (
        "camera2",
        "Академика Королёва - Университетская Набережная",
        "57164ea3-c4fa-45ae-b315-79544770eb36",
    ),
    (
        "camera3",
        "250-летия Челябинска - Салавата Юлаева",
        "0cff55c4-ba25-4976-bd39-276fcbdb054a",
    ),
    (
        "camera4",
        "Бейвеля - Скульптора Головницкого",
        "30bb3006-25af-44be-9a27-3e3ec3e178f2",
    ),
    (
        "camera5",
        "Комсомольский - Красного Урала",
        "5ee19d52-94b2-4bb7-94a0-14bbc7e4f181",
    ),
    (
        "camera6",
        "Копейское ш. - Енисейская",
        "7f3d95d0-39c4-4ff4-ac5a-07649eeca6e6",
    ),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Rtsp,
    Hls,
    Mjpeg,
    Snapshot,
    /// Synthetic `stub://` source for tests and demos.
    Stub,
}

impl Protocol {
    /// Whether a single fetch yields a frame without holding a stream open.
    pub fn serves_snapshot(&self) -> bool {
        matches!(self, Protocol::Snapshot | Protocol::Stub)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Hd,
    Main,
    Standard,
    Lossy,
}

impl QualityTier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hd" => Some(QualityTier::Hd),
            "main" => Some(QualityTier::Main),
            "standard" => Some(QualityTier::Standard),
            "lossy" => Some(QualityTier::Lossy),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCandidate {
    pub protocol: Protocol,
    pub quality: QualityTier,
    pub url: String,
}

impl EndpointCandidate {
    pub fn new(protocol: Protocol, quality: QualityTier, url: impl Into<String>) -> Self {
        Self {
            protocol,
            quality,
            url: url.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraEndpoint {
    pub camera_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub candidates: Vec<EndpointCandidate>,
}

/// Candidate list for an is74 CDN camera, highest fidelity first.
pub fn is74_candidates(uuid: &str) -> Vec<EndpointCandidate> {
    vec![
        EndpointCandidate::new(
            Protocol::Rtsp,
            QualityTier::Hd,
            format!("{IS74_RTSP_BASE}?uuid={uuid}&quality=hd"),
        ),
        EndpointCandidate::new(
            Protocol::Rtsp,
            QualityTier::Main,
            format!("{IS74_RTSP_BASE}?uuid={uuid}&quality=main"),
        ),
        EndpointCandidate::new(
            Protocol::Hls,
            QualityTier::Standard,
            format!("{IS74_HLS_BASE}?uuid={uuid}"),
        ),
        EndpointCandidate::new(
            Protocol::Snapshot,
            QualityTier::Lossy,
            format!("{IS74_SNAPSHOT_BASE}?uuid={uuid}&lossy=1"),
        ),
        EndpointCandidate::new(
            Protocol::Snapshot,
            QualityTier::Standard,
            format!("{IS74_SNAPSHOT_BASE}?uuid={uuid}"),
        ),
        EndpointCandidate::new(
            Protocol::Snapshot,
            QualityTier::Standard,
            format!("{IS74_SNAPSHOT_BASE}/{uuid}"),
        ),
    ]
}

#[derive(Clone, Debug, Default)]
pub struct CameraRegistry {
    cameras: BTreeMap<String, CameraEndpoint>,
}

impl CameraRegistry {
    pub fn new(endpoints: Vec<CameraEndpoint>) -> Result<Self> {
        let mut cameras = BTreeMap::new();
        for endpoint in endpoints {
            let id = endpoint.camera_id.trim().to_string();
            if id.is_empty() {
                return Err(anyhow!("camera entry with empty camera_id"));
            }
            if cameras.insert(id.clone(), endpoint).is_some() {
                return Err(anyhow!("duplicate camera id '{}'", id));
            }
        }
        Ok(Self { cameras })
    }

    /// The built-in is74 camera table.
    pub fn builtin() -> Self {
        let cameras = BUILTIN_CAMERAS
            .iter()
            .map(|(id, name, uuid)| {
                (
                    id.to_string(),
                    CameraEndpoint {
                        camera_id: id.to_string(),
                        name: Some(name.to_string()),
                        candidates: is74_candidates(uuid),
                    },
                )
            })
            .collect();
        Self { cameras }
    }

    /// Look up a camera. Unknown ids and empty candidate lists are configuration errors.
    pub fn lookup(&self, camera_id: &str) -> Result<&CameraEndpoint, PollError> {
        let endpoint = self.cameras.get(camera_id.trim()).ok_or_else(|| {
            PollError::configuration(format!("camera '{}' is not registered", camera_id))
        })?;
        if endpoint.candidates.is_empty() {
            return Err(PollError::configuration(format!(
                "camera '{}' has no endpoint candidates",
                camera_id
            )));
        }
        Ok(endpoint)
    }

    pub fn contains(&self, camera_id: &str) -> bool {
        self.cameras.contains_key(camera_id.trim())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CameraEndpoint> {
        self.cameras.values()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}
