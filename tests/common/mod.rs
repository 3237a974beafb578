#![allow(dead_code)]

use anyhow::{anyhow, Result};
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stop_monitor::camera::{CameraEndpoint, CameraRegistry, EndpointCandidate, Protocol, QualityTier};
use stop_monitor::detect::{
    DetectedObject, DetectionPolicy, DetectorBackend, NoopRecognizer, ObjectClass, StubBackend,
};
use stop_monitor::forecast::SeriesPoint;
use stop_monitor::ingest::{FrameRead, FrameReader, FrameSource, OpenOptions, SourceOpener};
use stop_monitor::storage::{InMemoryResultStore, ResultStore, StoreFactory, StoredLoad};
use stop_monitor::{
    BoundingBox, BusSighting, EndpointResolver, Frame, LoadRecord, PollContext, PollError, Point,
    ResultWriter, Stop, StopId, ZoneMode,
};

/// How a scripted endpoint behaves when opened.
#[derive(Clone, Debug)]
pub enum Script {
    FailOpen,
    FailDecode,
    Frames { width: u32, height: u32, fps: Option<f32> },
}

/// Opener that serves scripted endpoints and counts opens per URL.
#[derive(Default)]
pub struct ScriptedOpener {
    scripts: HashMap<String, Script>,
    opens: Mutex<HashMap<String, usize>>,
    pub released: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    pub fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(url, script)| (url.to_string(), script))
                .collect(),
            ..Self::default()
        }
    }

    pub fn opens(&self, url: &str) -> usize {
        self.opens
            .lock()
            .map(|opens| opens.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

struct ScriptedReader {
    script: Script,
    released: Arc<AtomicUsize>,
}

impl FrameReader for ScriptedReader {
    fn read_frame(&mut self) -> Result<FrameRead, PollError> {
        match self.script {
            Script::FailDecode => Err(PollError::DecodeFailure(anyhow!("corrupt jpeg"))),
            Script::Frames { width, height, .. } => {
                Ok(FrameRead::Frame(Frame::filled(width, height, [40, 40, 40])))
            }
            Script::FailOpen => Err(PollError::CameraUnavailable(anyhow!("not open"))),
        }
    }

    fn source_fps(&self) -> Option<f32> {
        match self.script {
            Script::Frames { fps, .. } => fps,
            _ => None,
        }
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(
        &self,
        candidate: &EndpointCandidate,
        _options: &OpenOptions,
    ) -> Result<FrameSource, PollError> {
        if let Ok(mut opens) = self.opens.lock() {
            *opens.entry(candidate.url.clone()).or_insert(0) += 1;
        }
        let script = self
            .scripts
            .get(&candidate.url)
            .cloned()
            .unwrap_or(Script::FailOpen);
        if let Script::FailOpen = script {
            return Err(PollError::CameraUnavailable(anyhow!(
                "connection refused: {}",
                candidate.url
            )));
        }
        Ok(FrameSource::new(
            candidate.url.clone(),
            candidate.protocol,
            Box::new(ScriptedReader {
                script,
                released: self.released.clone(),
            }),
        ))
    }
}

/// Store factory whose stores refuse to persist one stop.
pub struct FailingStopStore {
    pub inner: InMemoryResultStore,
    pub fail_stop: StopId,
}

struct FailingStopHandle {
    inner: Box<dyn ResultStore>,
    fail_stop: StopId,
}

impl ResultStore for FailingStopHandle {
    fn insert_observation(&mut self, record: &LoadRecord, sightings: &[BusSighting]) -> Result<i64> {
        if record.stop_id == self.fail_stop {
            return Err(anyhow!("disk full"));
        }
        self.inner.insert_observation(record, sightings)
    }

    fn latest_load(&mut self, stop_id: StopId) -> Result<Option<StoredLoad>> {
        self.inner.latest_load(stop_id)
    }

    fn recent_sightings(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<BusSighting>> {
        self.inner.recent_sightings(stop_id, since_ms)
    }

    fn hourly_people_series(&mut self, stop_id: StopId, since_ms: i64) -> Result<Vec<SeriesPoint>> {
        self.inner.hourly_people_series(stop_id, since_ms)
    }
}

impl StoreFactory for FailingStopStore {
    fn open(&self) -> Result<Box<dyn ResultStore>> {
        Ok(Box::new(FailingStopHandle {
            inner: self.inner.open()?,
            fail_stop: self.fail_stop,
        }))
    }
}

/// Detector that holds each call until released (or five seconds pass).
pub struct GatedDetector {
    pub release: Receiver<()>,
    pub calls: AtomicUsize,
}

impl DetectorBackend for GatedDetector {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedObject>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        Ok(Vec::new())
    }
}

/// Detector whose provider is always down.
pub struct FailingDetector;

impl DetectorBackend for FailingDetector {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedObject>> {
        Err(anyhow!("inference service returned 502"))
    }
}

/// Detector that panics on every call.
pub struct PanickingDetector;

impl DetectorBackend for PanickingDetector {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedObject>> {
        panic!("model weights missing")
    }
}

/// Detector that answers only after `delay`.
pub struct SlowDetector {
    pub delay: Duration,
}

impl DetectorBackend for SlowDetector {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedObject>> {
        std::thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

pub fn person_at(cx: f32, cy: f32) -> DetectedObject {
    DetectedObject::new(
        ObjectClass::Person,
        0.9,
        BoundingBox::centered(cx, cy, 20.0, 40.0),
    )
}

pub fn bus_at(cx: f32, cy: f32) -> DetectedObject {
    DetectedObject::new(
        ObjectClass::Bus,
        0.8,
        BoundingBox::centered(cx, cy, 200.0, 120.0),
    )
}

pub fn rect_zone(x1: f32, y1: f32, x2: f32, y2: f32) -> Vec<Point> {
    vec![
        Point::new(x1, y1),
        Point::new(x2, y1),
        Point::new(x2, y2),
        Point::new(x1, y2),
    ]
}

pub fn stop(id: StopId, camera_id: Option<&str>, zone: Vec<Point>, active: bool) -> Stop {
    Stop {
        id,
        name: format!("stop {id}"),
        active,
        camera_id: camera_id.map(str::to_string),
        zone,
        latitude: 55.16,
        longitude: 61.40,
    }
}

/// Registry with one synthetic camera per id.
pub fn stub_registry(ids: &[&str], width: u32, height: u32) -> Arc<CameraRegistry> {
    let endpoints = ids
        .iter()
        .map(|id| CameraEndpoint {
            camera_id: id.to_string(),
            name: None,
            candidates: vec![EndpointCandidate::new(
                Protocol::Stub,
                QualityTier::Standard,
                format!("stub://{id}?width={width}&height={height}"),
            )],
        })
        .collect();
    match CameraRegistry::new(endpoints) {
        Ok(registry) => Arc::new(registry),
        Err(err) => panic!("registry: {err:#}"),
    }
}

pub fn context(
    resolver: EndpointResolver,
    detector: Arc<dyn DetectorBackend>,
    factory: Arc<dyn StoreFactory>,
    budget: Duration,
) -> Arc<PollContext> {
    Arc::new(PollContext {
        resolver,
        detector,
        recognizer: Arc::new(NoopRecognizer),
        policy: DetectionPolicy::default(),
        writer: ResultWriter::new(factory),
        zone_mode: ZoneMode::BoundingBox,
        budget,
    })
}

pub fn stub_detector(objects: Vec<DetectedObject>) -> Arc<dyn DetectorBackend> {
    Arc::new(StubBackend::new(objects))
}
