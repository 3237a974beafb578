mod common;

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    context, person_at, rect_zone, stop, stub_detector, stub_registry, FailingDetector,
    FailingStopStore, GatedDetector, PanickingDetector, SlowDetector,
};
use stop_monitor::ingest::{NetworkOpener, OpenOptions};
use stop_monitor::scheduler::SchedulerState;
use stop_monitor::storage::InMemoryResultStore;
use stop_monitor::worker::WorkerPool;
use stop_monitor::{
    EndpointResolver, FailureKind, PollOutcome, PollingScheduler, SnapshotPollTask,
    StaticStopDirectory,
};

fn resolver(ids: &[&str]) -> EndpointResolver {
    EndpointResolver::new(
        stub_registry(ids, 640, 480),
        Arc::new(NetworkOpener),
        OpenOptions::default(),
    )
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn tick_dispatches_only_pollable_stops() -> Result<()> {
    let store = InMemoryResultStore::new();
    let ctx = context(
        resolver(&["cam"]),
        stub_detector(vec![person_at(100.0, 100.0)]),
        Arc::new(store.clone()),
        Duration::from_secs(10),
    );
    let zone = rect_zone(0.0, 0.0, 640.0, 480.0);
    let directory = Arc::new(StaticStopDirectory::new(vec![
        stop(1, Some("cam"), zone.clone(), true),
        stop(2, Some("cam"), Vec::new(), true),
        stop(3, Some("cam"), zone, false),
    ]));
    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler =
        PollingScheduler::new(ctx, directory, WorkerPool::new(2, 8)?).with_outcome_sink(tx);

    let report = scheduler.tick()?;
    assert_eq!(report.total_stops, 3);
    assert_eq!(report.eligible, 1);
    assert_eq!(report.dispatched, vec![1]);
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let outcome = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(outcome.stop_id(), 1);
    assert!(outcome.is_success(), "{outcome:?}");
    assert!(rx.try_recv().is_err());
    assert_eq!(store.load_records().len(), 1);
    assert_eq!(store.load_records()[0].people_count, 1);
    Ok(())
}

#[test]
fn persistence_failure_on_one_stop_does_not_block_another() -> Result<()> {
    let store = InMemoryResultStore::new();
    let factory = FailingStopStore {
        inner: store.clone(),
        fail_stop: 10,
    };
    let ctx = context(
        resolver(&["x", "y"]),
        stub_detector(vec![person_at(50.0, 50.0), person_at(60.0, 60.0)]),
        Arc::new(factory),
        Duration::from_secs(10),
    );
    let zone = rect_zone(0.0, 0.0, 640.0, 480.0);
    let directory = Arc::new(StaticStopDirectory::new(vec![
        stop(10, Some("x"), zone.clone(), true),
        stop(20, Some("y"), zone, true),
    ]));
    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler =
        PollingScheduler::new(ctx, directory, WorkerPool::new(2, 8)?).with_outcome_sink(tx);

    let report = scheduler.tick()?;
    assert_eq!(report.dispatched.len(), 2);

    let mut outcomes = vec![
        rx.recv_timeout(Duration::from_secs(5))?,
        rx.recv_timeout(Duration::from_secs(5))?,
    ];
    outcomes.sort_by_key(PollOutcome::stop_id);
    assert_eq!(outcomes[0].failure_kind(), Some(FailureKind::PersistenceError));
    assert!(outcomes[1].is_success());

    let records = store.load_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].stop_id, 20);
    assert_eq!(records[0].people_count, 2);

    let stats = scheduler.stats();
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures.get("persistence_error"), Some(&1));
    Ok(())
}

#[test]
fn overlapping_tick_skips_stop_still_in_flight() -> Result<()> {
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let detector = Arc::new(GatedDetector {
        release: release_rx,
        calls: AtomicUsize::new(0),
    });
    let ctx = context(
        resolver(&["cam"]),
        detector.clone(),
        Arc::new(InMemoryResultStore::new()),
        Duration::from_secs(30),
    );
    let directory = Arc::new(StaticStopDirectory::new(vec![stop(
        5,
        Some("cam"),
        rect_zone(0.0, 0.0, 10.0, 10.0),
        true,
    )]));
    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler =
        PollingScheduler::new(ctx, directory, WorkerPool::new(2, 8)?).with_outcome_sink(tx);

    assert_eq!(scheduler.tick()?.dispatched, vec![5]);
    assert!(wait_for(|| detector.calls.load(Ordering::SeqCst) == 1));
    assert!(scheduler.in_flight().contains(5));

    let second = scheduler.tick()?;
    assert!(second.dispatched.is_empty());
    assert_eq!(second.skipped_overlap, vec![5]);
    let skipped = rx.recv_timeout(Duration::from_secs(1))?;
    assert_eq!(skipped.failure_kind(), Some(FailureKind::SkippedOverlap));

    release_tx.send(())?;
    let finished = rx.recv_timeout(Duration::from_secs(5))?;
    assert!(finished.is_success(), "{finished:?}");
    assert!(wait_for(|| !scheduler.in_flight().contains(5)));
    assert_eq!(scheduler.tick()?.dispatched, vec![5]);
    release_tx.send(())?;
    Ok(())
}

#[test]
fn full_queue_reports_saturation_without_blocking() -> Result<()> {
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let detector = Arc::new(GatedDetector {
        release: release_rx,
        calls: AtomicUsize::new(0),
    });
    let ids = ["a", "b", "c"];
    let ctx = context(
        resolver(&ids),
        detector,
        Arc::new(InMemoryResultStore::new()),
        Duration::from_secs(30),
    );
    let zone = rect_zone(0.0, 0.0, 10.0, 10.0);
    let directory = Arc::new(StaticStopDirectory::new(
        ids.iter()
            .enumerate()
            .map(|(i, id)| stop(i as i64 + 1, Some(id), zone.clone(), true))
            .collect(),
    ));
    let scheduler = PollingScheduler::new(ctx, directory, WorkerPool::new(1, 1)?);

    let started = Instant::now();
    let report = scheduler.tick()?;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!report.saturated.is_empty());
    assert_eq!(report.dispatched.len() + report.saturated.len(), 3);
    assert_eq!(
        scheduler.stats().failures.get("worker_pool_saturated").copied(),
        Some(report.saturated.len() as u64)
    );
    for _ in 0..3 {
        release_tx.send(())?;
    }
    Ok(())
}

#[test]
fn manual_poll_reports_unknown_and_incomplete_stops() -> Result<()> {
    let ctx = context(
        resolver(&["cam"]),
        stub_detector(Vec::new()),
        Arc::new(InMemoryResultStore::new()),
        Duration::from_secs(10),
    );
    let directory = Arc::new(StaticStopDirectory::new(vec![
        stop(1, None, rect_zone(0.0, 0.0, 5.0, 5.0), true),
        stop(2, Some("cam"), rect_zone(0.0, 0.0, 5.0, 5.0), true),
    ]));
    let scheduler = PollingScheduler::new(ctx, directory, WorkerPool::new(1, 4)?);

    let unknown = scheduler.poll_now(99);
    assert_eq!(unknown.failure_kind(), Some(FailureKind::ConfigurationIncomplete));
    let no_camera = scheduler.poll_now(1);
    assert_eq!(no_camera.failure_kind(), Some(FailureKind::ConfigurationIncomplete));
    let ok = scheduler.poll_now(2);
    assert!(ok.is_success(), "{ok:?}");

    let all = scheduler.poll_all_now()?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].stop_id(), 2);
    Ok(())
}

#[test]
fn run_loop_ticks_until_shutdown() -> Result<()> {
    let store = InMemoryResultStore::new();
    let ctx = context(
        resolver(&["cam"]),
        stub_detector(Vec::new()),
        Arc::new(store.clone()),
        Duration::from_secs(10),
    );
    let directory = Arc::new(StaticStopDirectory::new(vec![stop(
        1,
        Some("cam"),
        rect_zone(0.0, 0.0, 5.0, 5.0),
        true,
    )]));
    let scheduler = Arc::new(PollingScheduler::new(ctx, directory, WorkerPool::new(1, 4)?));
    let (trigger_tx, trigger_rx) = crossbeam_channel::unbounded();
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let runner = {
        let scheduler = scheduler.clone();
        std::thread::spawn(move || scheduler.run(trigger_rx, stop_rx))
    };

    trigger_tx.send(Instant::now())?;
    assert!(wait_for(|| store.load_records().len() == 1));
    stop_tx.send(())?;
    let result = runner.join().map_err(|_| anyhow::anyhow!("runner panicked"))?;
    assert!(result.is_ok());
    assert_eq!(scheduler.stats().ticks, 1);
    Ok(())
}

#[test]
fn detector_error_becomes_provider_failure() -> Result<()> {
    let store = InMemoryResultStore::new();
    let ctx = context(
        resolver(&["cam"]),
        Arc::new(FailingDetector),
        Arc::new(store.clone()),
        Duration::from_secs(10),
    );
    let target = stop(4, Some("cam"), rect_zone(0.0, 0.0, 5.0, 5.0), true);
    let mut task = SnapshotPollTask::new(ctx, target);

    let outcome = task.run();
    assert_eq!(outcome.stop_id(), 4);
    assert_eq!(
        outcome.failure_kind(),
        Some(FailureKind::DetectionProviderError)
    );
    assert!(store.load_records().is_empty());
    Ok(())
}

#[test]
fn slow_detection_exceeds_task_budget() -> Result<()> {
    let store = InMemoryResultStore::new();
    let ctx = context(
        resolver(&["cam"]),
        Arc::new(SlowDetector {
            delay: Duration::from_millis(100),
        }),
        Arc::new(store.clone()),
        Duration::from_millis(20),
    );
    let target = stop(6, Some("cam"), rect_zone(0.0, 0.0, 5.0, 5.0), true);
    let mut task = SnapshotPollTask::new(ctx, target);

    let outcome = task.run();
    assert_eq!(outcome.failure_kind(), Some(FailureKind::BudgetExceeded));
    assert!(store.load_records().is_empty());
    Ok(())
}

#[test]
fn panicking_detector_fails_poll_and_frees_stop() -> Result<()> {
    let ctx = context(
        resolver(&["cam"]),
        Arc::new(PanickingDetector),
        Arc::new(InMemoryResultStore::new()),
        Duration::from_secs(10),
    );
    let directory = Arc::new(StaticStopDirectory::new(vec![stop(
        8,
        Some("cam"),
        rect_zone(0.0, 0.0, 5.0, 5.0),
        true,
    )]));
    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler =
        PollingScheduler::new(ctx, directory, WorkerPool::new(1, 4)?).with_outcome_sink(tx);

    assert_eq!(scheduler.tick()?.dispatched, vec![8]);
    let outcome = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(outcome.stop_id(), 8);
    assert_eq!(
        outcome.failure_kind(),
        Some(FailureKind::DetectionProviderError)
    );
    assert!(wait_for(|| !scheduler.in_flight().contains(8)));
    assert_eq!(
        scheduler.stats().failures.get("detection_provider_error"),
        Some(&1)
    );

    let again = scheduler.tick()?;
    assert_eq!(again.dispatched, vec![8]);
    assert!(again.skipped_overlap.is_empty());
    let second = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(
        second.failure_kind(),
        Some(FailureKind::DetectionProviderError)
    );
    Ok(())
}

#[test]
fn hung_detector_is_cut_off_at_budget_and_frees_stop() -> Result<()> {
    let (_release_tx, release_rx) = crossbeam_channel::unbounded();
    let detector = Arc::new(GatedDetector {
        release: release_rx,
        calls: AtomicUsize::new(0),
    });
    let ctx = context(
        resolver(&["cam"]),
        detector,
        Arc::new(InMemoryResultStore::new()),
        Duration::from_millis(300),
    );
    let directory = Arc::new(StaticStopDirectory::new(vec![stop(
        12,
        Some("cam"),
        rect_zone(0.0, 0.0, 5.0, 5.0),
        true,
    )]));
    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler =
        PollingScheduler::new(ctx, directory, WorkerPool::new(1, 4)?).with_outcome_sink(tx);

    let started = Instant::now();
    assert_eq!(scheduler.tick()?.dispatched, vec![12]);
    let outcome = rx.recv_timeout(Duration::from_secs(3))?;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.failure_kind(), Some(FailureKind::BudgetExceeded));
    assert!(wait_for(|| !scheduler.in_flight().contains(12)));
    Ok(())
}
