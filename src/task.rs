//! One poll of one stop: resolve, fetch a frame, detect, filter, persist.

use anyhow::anyhow;
use crossbeam_channel::RecvTimeoutError;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::{
    recognize_bus, DetectedObject, DetectionPolicy, DetectorBackend, PlateRecognizer,
};
use crate::frame::Frame;
use crate::error::PollError;
use crate::model::{BusSighting, LoadRecord, ObservationCounts, PollOutcome, Stop};
use crate::resolve::{EndpointResolver, Resolved};
use crate::smooth::DetectionSmoother;
use crate::storage::ResultWriter;
use crate::zone::{ZoneFilter, ZoneMode};

/// Everything a poll task needs, shared read-only by all workers.
pub struct PollContext {
    pub resolver: EndpointResolver,
    pub detector: Arc<dyn DetectorBackend>,
    pub recognizer: Arc<dyn PlateRecognizer>,
    pub policy: DetectionPolicy,
    pub writer: ResultWriter,
    pub zone_mode: ZoneMode,
    /// Overall wall-clock budget for one task. Checked between stages; the
    /// detector call is bounded by what is left of it. Endpoint opens and
    /// reads are bounded by the resolver's own timeouts instead.
    pub budget: Duration,
}

pub struct SnapshotPollTask {
    ctx: Arc<PollContext>,
    stop: Stop,
    smoother: Option<DetectionSmoother>,
}

impl SnapshotPollTask {
    pub fn new(ctx: Arc<PollContext>, stop: Stop) -> Self {
        Self {
            ctx,
            stop,
            smoother: None,
        }
    }

    /// Smooth counts through a window carried over from earlier polls of the
    /// same lineage.
    pub fn with_smoother(mut self, smoother: DetectionSmoother) -> Self {
        self.smoother = Some(smoother);
        self
    }

    pub fn into_smoother(self) -> Option<DetectionSmoother> {
        self.smoother
    }

    pub fn stop(&self) -> &Stop {
        &self.stop
    }

    /// Run the task. Never panics on a failed step and never returns an error:
    /// every failure becomes a `PollOutcome::Failure`.
    pub fn run(&mut self) -> PollOutcome {
        let started = Instant::now();
        match self.execute(started) {
            Ok(outcome) => {
                if let PollOutcome::Success {
                    people_count,
                    bus_count,
                    record_id,
                    ..
                } = &outcome
                {
                    log::info!(
                        "poll stop {}: people={} buses={} record={} in {:?}",
                        self.stop.id,
                        people_count,
                        bus_count,
                        record_id,
                        started.elapsed()
                    );
                }
                outcome
            }
            Err(err) => {
                log::warn!("poll stop {} failed [{}]: {}", self.stop.id, err.kind(), err);
                PollOutcome::failure(self.stop.id, &err)
            }
        }
    }

    fn check_budget(&self, started: Instant) -> Result<(), PollError> {
        let elapsed = started.elapsed();
        if elapsed > self.ctx.budget {
            return Err(PollError::BudgetExceeded(elapsed));
        }
        Ok(())
    }

    /// Run detection on a helper thread and stop waiting once the budget is
    /// spent. A hung call is left behind; the stop is released.
    fn detect_within_budget(
        &self,
        frame: &Arc<Frame>,
        started: Instant,
    ) -> Result<Vec<DetectedObject>, PollError> {
        let remaining = self
            .ctx
            .budget
            .checked_sub(started.elapsed())
            .ok_or_else(|| PollError::BudgetExceeded(started.elapsed()))?;
        let detector = Arc::clone(&self.ctx.detector);
        let name = detector.name();
        let frame = Arc::clone(frame);
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name(format!("detect-stop-{}", self.stop.id))
            .spawn(move || {
                let _ = tx.send(detector.detect(&frame));
            })
            .map_err(|e| PollError::DetectionProviderError(anyhow!("spawn detector call: {}", e)))?;

        match rx.recv_timeout(remaining) {
            Ok(result) => result.map_err(|e| PollError::DetectionProviderError(e.context(name))),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("stop {}: detector '{}' still running at budget", self.stop.id, name);
                Err(PollError::BudgetExceeded(started.elapsed()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PollError::DetectionProviderError(anyhow!(
                "detector '{}' panicked",
                name
            ))),
        }
    }

    fn execute(&mut self, started: Instant) -> Result<PollOutcome, PollError> {
        let ctx = Arc::clone(&self.ctx);
        let stop_id = self.stop.id;
        let (camera_id, zone) = self.stop.pollable_parts()?;
        let zone_filter = ZoneFilter::new(zone, ctx.zone_mode);

        let Resolved {
            source,
            first_frame: frame,
            candidate,
            ..
        } = ctx.resolver.resolve_snapshot(camera_id)?;
        drop(source);
        self.check_budget(started)?;

        let frame = Arc::new(frame);
        let raw = self.detect_within_budget(&frame, started)?;
        let sample = ctx.policy.apply(raw, frame.width(), frame.height());
        let people_in_zone = zone_filter.filter(&sample.people);
        let raw_counts = ObservationCounts {
            people: people_in_zone.len() as u32,
            buses: sample.buses.len() as u32,
        };
        let counts = match self.smoother.as_mut() {
            Some(smoother) => smoother.observe(raw_counts),
            None => raw_counts,
        };
        self.check_budget(started)?;

        let recognized: Vec<Option<String>> = sample
            .buses
            .iter()
            .map(|bus| recognize_bus(ctx.recognizer.as_ref(), &frame, &bus.bbox))
            .collect();
        self.check_budget(started)?;

        let mut session = ctx.writer.begin()?;
        let people_before = session.people_before(stop_id)?;
        let timestamp_ms = frame.captured_at_ms;

        let record = LoadRecord {
            stop_id,
            timestamp_ms,
            people_count: counts.people,
            bus_count: counts.buses,
            payload: json!({
                "people_detections": people_in_zone,
                "bus_detections": sample.buses,
                "stop_zone": zone_filter.rect(),
                "people_before": people_before,
                "raw_counts": raw_counts,
                "source_url": candidate.url,
                "frame_size": [frame.width(), frame.height()],
            }),
        };
        let sightings: Vec<BusSighting> = sample
            .buses
            .iter()
            .zip(recognized.iter())
            .map(|(bus, recognized_id)| BusSighting {
                stop_id,
                detected_at_ms: timestamp_ms,
                recognized_id: recognized_id.clone(),
                confidence: bus.confidence,
                bbox: bus.bbox,
                payload: json!({
                    "people_before": people_before,
                    "people_after": counts.people,
                }),
            })
            .collect();

        // Past this point a late result would only add backlog.
        self.check_budget(started)?;
        let record_id = session.commit(&record, &sightings)?;

        Ok(PollOutcome::Success {
            stop_id,
            record_id,
            people_count: counts.people,
            bus_count: counts.buses,
            people_before,
            recognized_buses: recognized.into_iter().flatten().collect(),
        })
    }
}

/// Message used when a poll job panics.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> PollError {
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    PollError::DetectionProviderError(anyhow!("poll task panicked: {}", text))
}
