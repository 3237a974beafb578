use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::camera::{CameraEndpoint, CameraRegistry};
use crate::model::Stop;
use crate::zone::ZoneMode;

const DEFAULT_DB_PATH: &str = "stop_monitor.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8791";
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_TASK_BUDGET_SECS: u64 = 30;
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 1000;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.2;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    db_path: Option<String>,
    api: Option<AddrConfigFile>,
    relay: Option<RelayConfigFile>,
    scheduler: Option<SchedulerConfigFile>,
    ingest: Option<IngestConfigFile>,
    detector: Option<DetectorConfigFile>,
    ocr: Option<UrlConfigFile>,
    forecast: Option<UrlConfigFile>,
    zone: Option<ZoneConfigFile>,
    cameras: Option<Vec<CameraEndpoint>>,
    #[serde(default)]
    stops: Vec<Stop>,
}

#[derive(Debug, Deserialize, Default)]
struct AddrConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    addr: Option<String>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerConfigFile {
    interval_secs: Option<u64>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    task_budget_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    open_timeout_ms: Option<u64>,
    read_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    url: Option<String>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct UrlConfigFile {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ZoneConfigFile {
    mode: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    Stub,
    Remote,
}

impl DetectorKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(DetectorKind::Stub),
            "remote" => Ok(DetectorKind::Remote),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub api_addr: String,
    pub relay_addr: String,
    pub scheduler: SchedulerSettings,
    pub ingest: IngestSettings,
    pub detector: DetectorSettings,
    pub ocr_url: Option<String>,
    pub forecast_url: Option<String>,
    pub zone_mode: ZoneMode,
    pub relay_jpeg_quality: u8,
    /// `None` selects the built-in camera table.
    pub cameras: Option<Vec<CameraEndpoint>>,
    pub stops: Vec<Stop>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_budget: Duration,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub open_timeout: Duration,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub url: Option<String>,
    pub confidence_threshold: f32,
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            api_addr: DEFAULT_API_ADDR.to_string(),
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            scheduler: SchedulerSettings {
                interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
                workers: DEFAULT_WORKERS,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                task_budget: Duration::from_secs(DEFAULT_TASK_BUDGET_SECS),
            },
            ingest: IngestSettings {
                open_timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
                read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            },
            detector: DetectorSettings {
                backend: DetectorKind::Stub,
                url: None,
                confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
                timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
            },
            ocr_url: None,
            forecast_url: None,
            zone_mode: ZoneMode::BoundingBox,
            relay_jpeg_quality: DEFAULT_JPEG_QUALITY,
            cameras: None,
            stops: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Optional file named by `STOP_MONITOR_CONFIG`, then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STOP_MONITOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// File values only, without environment overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let scheduler = file.scheduler.unwrap_or_default();
        let ingest = file.ingest.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let relay = file.relay.unwrap_or_default();

        let backend = match detector.backend.as_deref() {
            Some(value) => DetectorKind::parse(value)?,
            None => defaults.detector.backend,
        };
        let zone_mode = match file.zone.and_then(|zone| zone.mode) {
            Some(value) => ZoneMode::parse(&value)
                .ok_or_else(|| anyhow!("unknown zone mode '{}'", value))?,
            None => defaults.zone_mode,
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            api_addr: file.api.and_then(|api| api.addr).unwrap_or(defaults.api_addr),
            relay_addr: relay.addr.unwrap_or(defaults.relay_addr),
            scheduler: SchedulerSettings {
                interval: scheduler
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.scheduler.interval),
                workers: scheduler.workers.unwrap_or(defaults.scheduler.workers),
                queue_capacity: scheduler
                    .queue_capacity
                    .unwrap_or(defaults.scheduler.queue_capacity),
                task_budget: scheduler
                    .task_budget_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.scheduler.task_budget),
            },
            ingest: IngestSettings {
                open_timeout: ingest
                    .open_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.ingest.open_timeout),
                read_timeout: ingest
                    .read_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.ingest.read_timeout),
            },
            detector: DetectorSettings {
                backend,
                url: detector.url,
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(defaults.detector.confidence_threshold),
                timeout: defaults.detector.timeout,
            },
            ocr_url: file.ocr.and_then(|ocr| ocr.url),
            forecast_url: file.forecast.and_then(|forecast| forecast.url),
            zone_mode,
            relay_jpeg_quality: relay.jpeg_quality.unwrap_or(defaults.relay_jpeg_quality),
            cameras: file.cameras,
            stops: file.stops,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("STOP_MONITOR_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_value("STOP_MONITOR_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(addr) = env_value("STOP_MONITOR_RELAY_ADDR") {
            self.relay_addr = addr;
        }
        if let Some(interval) = env_value("STOP_MONITOR_INTERVAL_SECS") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("STOP_MONITOR_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.scheduler.interval = Duration::from_secs(seconds);
        }
        if let Some(workers) = env_value("STOP_MONITOR_WORKERS") {
            self.scheduler.workers = workers
                .parse()
                .map_err(|_| anyhow!("STOP_MONITOR_WORKERS must be an integer"))?;
        }
        if let Some(url) = env_value("STOP_MONITOR_DETECTOR_URL") {
            self.detector.url = Some(url);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.scheduler.interval.is_zero() {
            return Err(anyhow!("scheduler interval must be greater than zero"));
        }
        if self.scheduler.workers == 0 {
            return Err(anyhow!("scheduler workers must be greater than zero"));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(anyhow!("scheduler queue capacity must be greater than zero"));
        }
        if self.scheduler.task_budget.is_zero() {
            return Err(anyhow!("task budget must be greater than zero"));
        }
        if self.detector.backend == DetectorKind::Remote
            && self.detector.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(anyhow!("remote detector requires detector.url"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("detector confidence threshold must be within [0, 1]"));
        }
        if self.relay_jpeg_quality == 0 || self.relay_jpeg_quality > 100 {
            return Err(anyhow!("relay jpeg quality must be within 1..=100"));
        }
        let mut seen = HashSet::new();
        for stop in &self.stops {
            if !seen.insert(stop.id) {
                return Err(anyhow!("duplicate stop id {}", stop.id));
            }
        }
        Ok(())
    }

    pub fn camera_registry(&self) -> Result<CameraRegistry> {
        match &self.cameras {
            Some(cameras) => CameraRegistry::new(cameras.clone()),
            None => Ok(CameraRegistry::builtin()),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
