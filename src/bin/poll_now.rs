//! poll_now - run one poll of a stop (or every eligible stop) and print the outcomes

use anyhow::{anyhow, Result};
use clap::Parser;

use stop_monitor::{Monitor, MonitorConfig, PollOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stop id to poll.
    #[arg(long, conflicts_with = "all")]
    stop: Option<i64>,
    /// Poll every eligible stop through the worker pool.
    #[arg(long)]
    all: bool,
    /// Override the result database path.
    #[arg(long, env = "STOP_MONITOR_DB_PATH")]
    db_path: Option<String>,
    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = MonitorConfig::load()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    let monitor = Monitor::build(config)?;
    let mut scheduler = monitor.scheduler()?;

    let outcomes: Vec<PollOutcome> = match (args.stop, args.all) {
        (Some(stop_id), _) => vec![scheduler.poll_now(stop_id)],
        (None, true) => scheduler.poll_all_now()?,
        (None, false) => return Err(anyhow!("pass --stop <id> or --all")),
    };
    scheduler.shutdown();

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&outcomes)?
    } else {
        serde_json::to_string(&outcomes)?
    };
    println!("{rendered}");

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if failed > 0 {
        return Err(anyhow!("{} of {} polls failed", failed, outcomes.len()));
    }
    Ok(())
}
