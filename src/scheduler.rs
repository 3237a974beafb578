//! Periodic polling of eligible stops.
//!
//! The scheduler cycles `Idle -> Tick -> Dispatching -> Idle` once per trigger.
//! A tick reads the stop directory, keeps the pollable stops, and hands one
//! `SnapshotPollTask` per stop to the worker pool without waiting for it.
//!
//! At most one poll per stop is in flight. A stop whose previous poll has not
//! finished is skipped for this tick and recorded as `SkippedOverlap`. Periodic
//! outcomes are only visible through logs and `OutcomeStats`.

use anyhow::{anyhow, Result};
use crossbeam_channel::{select, Receiver, Sender};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::PollError;
use crate::model::{PollOutcome, Stop, StopId};
use crate::now_ms;
use crate::task::{panic_message, PollContext, SnapshotPollTask};
use crate::worker::WorkerPool;

/// Grace period on top of the task budget when waiting for manual polls.
const MANUAL_WAIT_GRACE: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Stop directory
// ----------------------------------------------------------------------------

/// Read-only view of the configured stops.
pub trait StopDirectory: Send + Sync {
    fn stops(&self) -> Result<Vec<Stop>>;

    fn get(&self, stop_id: StopId) -> Result<Option<Stop>> {
        Ok(self.stops()?.into_iter().find(|s| s.id == stop_id))
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticStopDirectory {
    stops: Vec<Stop>,
}

impl StaticStopDirectory {
    pub fn new(stops: Vec<Stop>) -> Self {
        Self { stops }
    }
}

impl StopDirectory for StaticStopDirectory {
    fn stops(&self) -> Result<Vec<Stop>> {
        Ok(self.stops.clone())
    }
}

// ----------------------------------------------------------------------------
// In-flight tracking
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<StopId>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the stop. `None` when a poll for it is already running.
    pub fn try_acquire(&self, stop_id: StopId) -> Option<InFlightGuard> {
        if lock(&self.active).insert(stop_id) {
            Some(InFlightGuard {
                active: self.active.clone(),
                stop_id,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, stop_id: StopId) -> bool {
        lock(&self.active).contains(&stop_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the stop's claim when dropped, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    active: Arc<Mutex<HashSet<StopId>>>,
    stop_id: StopId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.stop_id);
    }
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub successes: u64,
    pub failures: BTreeMap<String, u64>,
    pub last_tick_ms: Option<i64>,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub struct OutcomeStats {
    inner: Mutex<StatsSnapshot>,
}

impl OutcomeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &PollOutcome) {
        let mut inner = lock(&self.inner);
        match outcome.failure_kind() {
            None => inner.successes += 1,
            Some(kind) => *inner.failures.entry(kind.as_str().to_string()).or_default() += 1,
        }
    }

    fn record_tick(&self, dispatched: usize) {
        let mut inner = lock(&self.inner);
        inner.ticks += 1;
        inner.dispatched += dispatched as u64;
        inner.last_tick_ms = Some(now_ms());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        lock(&self.inner).clone()
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Tick,
    Dispatching,
}

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub total_stops: usize,
    pub eligible: usize,
    pub dispatched: Vec<StopId>,
    pub skipped_overlap: Vec<StopId>,
    pub saturated: Vec<StopId>,
}

pub struct PollingScheduler {
    ctx: Arc<PollContext>,
    directory: Arc<dyn StopDirectory>,
    pool: WorkerPool,
    in_flight: InFlightRegistry,
    stats: Arc<OutcomeStats>,
    state: Mutex<SchedulerState>,
    outcome_sink: Option<Sender<PollOutcome>>,
}

impl PollingScheduler {
    pub fn new(ctx: Arc<PollContext>, directory: Arc<dyn StopDirectory>, pool: WorkerPool) -> Self {
        Self {
            ctx,
            directory,
            pool,
            in_flight: InFlightRegistry::new(),
            stats: Arc::new(OutcomeStats::new()),
            state: Mutex::new(SchedulerState::Idle),
            outcome_sink: None,
        }
    }

    /// Also deliver every periodic outcome to `sink`.
    pub fn with_outcome_sink(mut self, sink: Sender<PollOutcome>) -> Self {
        self.outcome_sink = Some(sink);
        self
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SchedulerState) {
        *lock(&self.state) = state;
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.in_flight = self.in_flight.len();
        snapshot
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    pub fn directory(&self) -> &Arc<dyn StopDirectory> {
        &self.directory
    }

    pub fn context(&self) -> &Arc<PollContext> {
        &self.ctx
    }

    fn report(&self, outcome: PollOutcome) {
        self.stats.record(&outcome);
        if let Some(sink) = &self.outcome_sink {
            let _ = sink.send(outcome);
        }
    }

    /// One scheduler tick. Returns once every eligible stop has been
    /// dispatched, skipped, or refused; never waits for a poll to finish.
    pub fn tick(&self) -> Result<TickReport> {
        self.set_state(SchedulerState::Tick);
        let stops = match self.directory.stops() {
            Ok(stops) => stops,
            Err(err) => {
                self.set_state(SchedulerState::Idle);
                log::error!("scheduler tick: stop directory unavailable: {:#}", err);
                return Err(err);
            }
        };
        let mut report = TickReport {
            total_stops: stops.len(),
            ..TickReport::default()
        };
        let eligible: Vec<Stop> = stops.into_iter().filter(Stop::is_pollable).collect();
        report.eligible = eligible.len();

        self.set_state(SchedulerState::Dispatching);
        for stop in eligible {
            let stop_id = stop.id;
            let Some(guard) = self.in_flight.try_acquire(stop_id) else {
                log::warn!("stop {}: previous poll still running, skipping", stop_id);
                self.report(PollOutcome::failure(stop_id, &PollError::SkippedOverlap));
                report.skipped_overlap.push(stop_id);
                continue;
            };

            let ctx = self.ctx.clone();
            let stats = self.stats.clone();
            let sink = self.outcome_sink.clone();
            let job = move || {
                let _guard = guard;
                let outcome = run_guarded(SnapshotPollTask::new(ctx, stop));
                stats.record(&outcome);
                if let Some(sink) = sink {
                    let _ = sink.send(outcome);
                }
            };
            match self.pool.try_submit(job) {
                Ok(()) => report.dispatched.push(stop_id),
                Err(err) => {
                    log::warn!("stop {}: not dispatched: {}", stop_id, err);
                    self.report(PollOutcome::failure(stop_id, &err));
                    report.saturated.push(stop_id);
                }
            }
        }

        self.stats.record_tick(report.dispatched.len());
        self.set_state(SchedulerState::Idle);
        log::info!(
            "scheduler tick: {} stops, {} eligible, {} dispatched, {} skipped, {} refused",
            report.total_stops,
            report.eligible,
            report.dispatched.len(),
            report.skipped_overlap.len(),
            report.saturated.len()
        );
        Ok(report)
    }

    /// Poll one stop on the caller's thread and return its outcome.
    pub fn poll_now(&self, stop_id: StopId) -> PollOutcome {
        let stop = match self.directory.get(stop_id) {
            Ok(Some(stop)) => stop,
            Ok(None) => {
                return PollOutcome::failure(
                    stop_id,
                    &PollError::configuration(format!("stop {} is not configured", stop_id)),
                )
            }
            Err(err) => {
                return PollOutcome::failure(
                    stop_id,
                    &PollError::configuration(format!("stop directory unavailable: {:#}", err)),
                )
            }
        };
        let Some(_guard) = self.in_flight.try_acquire(stop_id) else {
            return PollOutcome::failure(stop_id, &PollError::SkippedOverlap);
        };
        let outcome = run_guarded(SnapshotPollTask::new(self.ctx.clone(), stop));
        self.stats.record(&outcome);
        outcome
    }

    /// Poll every eligible stop through the worker pool and wait for all
    /// outcomes. Stops that do not report within the task budget are
    /// returned as `BudgetExceeded`.
    pub fn poll_all_now(&self) -> Result<Vec<PollOutcome>> {
        let stops: Vec<Stop> = self
            .directory
            .stops()?
            .into_iter()
            .filter(Stop::is_pollable)
            .collect();
        let (tx, rx) = crossbeam_channel::unbounded::<PollOutcome>();
        let mut outcomes = Vec::with_capacity(stops.len());
        let mut pending: HashSet<StopId> = HashSet::new();

        for stop in stops {
            let stop_id = stop.id;
            let Some(guard) = self.in_flight.try_acquire(stop_id) else {
                outcomes.push(PollOutcome::failure(stop_id, &PollError::SkippedOverlap));
                continue;
            };
            let ctx = self.ctx.clone();
            let stats = self.stats.clone();
            let tx = tx.clone();
            let job = move || {
                let _guard = guard;
                let outcome = run_guarded(SnapshotPollTask::new(ctx, stop));
                stats.record(&outcome);
                let _ = tx.send(outcome);
            };
            match self.pool.try_submit(job) {
                Ok(()) => {
                    pending.insert(stop_id);
                }
                Err(err) => outcomes.push(PollOutcome::failure(stop_id, &err)),
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.ctx.budget + MANUAL_WAIT_GRACE;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(outcome) => {
                    pending.remove(&outcome.stop_id());
                    outcomes.push(outcome);
                }
                Err(_) => break,
            }
        }
        let waited = self.ctx.budget + MANUAL_WAIT_GRACE;
        let mut late: Vec<StopId> = pending.into_iter().collect();
        late.sort_unstable();
        for stop_id in late {
            outcomes.push(PollOutcome::failure(stop_id, &PollError::BudgetExceeded(waited)));
        }
        outcomes.sort_by_key(PollOutcome::stop_id);
        Ok(outcomes)
    }

    /// Tick on every trigger until `shutdown` fires or either channel closes.
    pub fn run(&self, trigger: Receiver<Instant>, shutdown: Receiver<()>) -> Result<()> {
        log::info!("scheduler running");
        loop {
            select! {
                recv(trigger) -> fired => {
                    if fired.is_err() {
                        return Err(anyhow!("scheduler trigger closed"));
                    }
                    if let Err(err) = self.tick() {
                        log::warn!("scheduler tick failed: {:#}", err);
                    }
                }
                recv(shutdown) -> _ => {
                    log::info!("scheduler stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Stop accepting work and wait for running polls.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

/// Run a task, converting a panic into a failure outcome.
fn run_guarded(mut task: SnapshotPollTask) -> PollOutcome {
    let stop_id = task.stop().id;
    match catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let err = panic_message(payload.as_ref());
            log::error!("poll stop {} panicked: {}", stop_id, err);
            PollOutcome::failure(stop_id, &err)
        }
    }
}
