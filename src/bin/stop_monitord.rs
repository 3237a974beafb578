//! stop_monitord - transit stop monitor daemon
//!
//! This daemon:
//! 1. Loads the stop/camera configuration (`STOP_MONITOR_CONFIG` + env overrides)
//! 2. Polls every eligible stop on a fixed interval through a bounded worker pool
//! 3. Serves live annotated camera relays over websocket
//! 4. Serves the loopback HTTP surface (health, stats, manual triggers)

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use stop_monitor::relay::RelayServer;
use stop_monitor::{Monitor, MonitorConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = MonitorConfig::load()?;
    log::info!(
        "stop_monitord {}: {} stops, poll every {}s with {} workers",
        env!("CARGO_PKG_VERSION"),
        config.stops.len(),
        config.scheduler.interval.as_secs(),
        config.scheduler.workers
    );
    let interval = config.scheduler.interval;
    let relay_addr = config.relay_addr.clone();

    let monitor = Monitor::build(config)?;
    let scheduler = Arc::new(monitor.scheduler()?);

    let relay_handle = RelayServer::new(relay_addr, Arc::new(monitor.relay())).spawn()?;
    log::info!("live relay listening on {}", relay_handle.addr);
    let api_handle = monitor.api_server(scheduler.clone()).spawn()?;
    log::info!("monitor api listening on {}", api_handle.addr);

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let trigger = crossbeam_channel::tick(interval);
    let scheduler_thread = {
        let scheduler = scheduler.clone();
        std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || {
                if let Err(err) = scheduler.run(trigger, stop_rx) {
                    log::error!("scheduler stopped: {:#}", err);
                }
            })?
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("stop_monitord waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    let _ = stop_tx.send(());
    scheduler_thread
        .join()
        .map_err(|_| anyhow!("scheduler thread panicked"))?;
    relay_handle.stop()?;
    api_handle.stop()?;

    match Arc::try_unwrap(scheduler) {
        Ok(mut scheduler) => scheduler.shutdown(),
        Err(_) => log::warn!("scheduler still shared at shutdown; workers detach"),
    }
    log::info!("stop_monitord stopped");
    Ok(())
}
