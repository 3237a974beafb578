//! Wiring: turns a `MonitorConfig` into the shared poll context, scheduler,
//! relay and API server used by the binaries.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::api::{ApiConfig, ApiServer};
use crate::config::{DetectorKind, DetectorSettings, MonitorConfig};
use crate::detect::{
    BackendRegistry, DetectionPolicy, DetectorBackend, NoopRecognizer, PlateRecognizer,
    RemoteBackend, RemoteRecognizer, StubBackend,
};
use crate::forecast::{ForecastProvider, RemoteForecaster};
use crate::ingest::{NetworkOpener, OpenOptions, SourceOpener};
use crate::relay::{LiveStreamRelay, RelayConfig};
use crate::resolve::EndpointResolver;
use crate::scheduler::{PollingScheduler, StaticStopDirectory, StopDirectory};
use crate::storage::{ResultWriter, SqliteStoreFactory, StoreFactory};
use crate::task::PollContext;
use crate::worker::WorkerPool;

/// Pick the configured detector out of a registry of the available ones.
pub fn build_detector(settings: &DetectorSettings) -> Result<Arc<dyn DetectorBackend>> {
    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::empty());
    if let Some(url) = settings.url.as_deref() {
        registry.register(RemoteBackend::new(url, settings.timeout));
    }
    let name = match settings.backend {
        DetectorKind::Stub => "stub",
        DetectorKind::Remote => "remote",
    };
    registry.set_default(name)?;
    let detector = registry.default_backend()?;
    detector
        .warm_up()
        .with_context(|| format!("warm up detector '{}'", detector.name()))?;
    log::info!(
        "detector '{}' selected (available: {})",
        detector.name(),
        registry.list().join(", ")
    );
    Ok(detector)
}

pub fn build_recognizer(config: &MonitorConfig) -> Arc<dyn PlateRecognizer> {
    match config.ocr_url.as_deref() {
        Some(url) => Arc::new(RemoteRecognizer::new(url, config.detector.timeout)),
        None => Arc::new(NoopRecognizer),
    }
}

/// Every long-lived component of the monitor, built once at startup.
pub struct Monitor {
    pub config: MonitorConfig,
    pub context: Arc<PollContext>,
    pub directory: Arc<dyn StopDirectory>,
    pub writer: ResultWriter,
    pub forecaster: Option<Arc<dyn ForecastProvider>>,
}

impl Monitor {
    /// Production wiring: network sources, configured detector, SQLite store.
    pub fn build(config: MonitorConfig) -> Result<Self> {
        let detector = build_detector(&config.detector)?;
        let factory = SqliteStoreFactory::new(config.db_path.clone())
            .with_context(|| format!("open result store {}", config.db_path))?;
        Self::build_with(config, Arc::new(NetworkOpener), detector, Arc::new(factory))
    }

    /// Wiring with the external seams supplied by the caller.
    pub fn build_with(
        config: MonitorConfig,
        opener: Arc<dyn SourceOpener>,
        detector: Arc<dyn DetectorBackend>,
        factory: Arc<dyn StoreFactory>,
    ) -> Result<Self> {
        let registry = Arc::new(config.camera_registry()?);
        for stop in &config.stops {
            if let Some(camera_id) = stop.camera_id.as_deref() {
                if !registry.contains(camera_id) {
                    log::warn!("stop {}: camera '{}' is not registered", stop.id, camera_id);
                }
            }
        }
        let resolver = EndpointResolver::new(
            registry,
            opener,
            OpenOptions {
                open_timeout: config.ingest.open_timeout,
                read_timeout: config.ingest.read_timeout,
            },
        );
        let writer = ResultWriter::new(factory);
        let context = Arc::new(PollContext {
            resolver,
            detector,
            recognizer: build_recognizer(&config),
            policy: DetectionPolicy::with_threshold(config.detector.confidence_threshold),
            writer: writer.clone(),
            zone_mode: config.zone_mode,
            budget: config.scheduler.task_budget,
        });
        let directory: Arc<dyn StopDirectory> =
            Arc::new(StaticStopDirectory::new(config.stops.clone()));
        let forecaster = config.forecast_url.as_deref().map(|url| {
            Arc::new(RemoteForecaster::new(url, config.detector.timeout)) as Arc<dyn ForecastProvider>
        });
        Ok(Self {
            config,
            context,
            directory,
            writer,
            forecaster,
        })
    }

    pub fn scheduler(&self) -> Result<PollingScheduler> {
        let pool = WorkerPool::new(
            self.config.scheduler.workers,
            self.config.scheduler.queue_capacity,
        )?;
        Ok(PollingScheduler::new(
            self.context.clone(),
            self.directory.clone(),
            pool,
        ))
    }

    pub fn relay(&self) -> LiveStreamRelay {
        LiveStreamRelay::new(
            self.context.resolver.clone(),
            self.context.detector.clone(),
            self.context.policy.clone(),
            self.directory.clone(),
            RelayConfig {
                jpeg_quality: self.config.relay_jpeg_quality,
                zone_mode: self.config.zone_mode,
            },
        )
    }

    pub fn api_server(&self, scheduler: Arc<PollingScheduler>) -> ApiServer {
        ApiServer::new(
            ApiConfig {
                addr: self.config.api_addr.clone(),
            },
            scheduler,
            self.writer.clone(),
            self.forecaster.clone(),
        )
    }
}
