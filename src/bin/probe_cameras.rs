//! probe_cameras - try every endpoint candidate of every camera and report
//! which ones open and decode a frame

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;
use std::io::IsTerminal;
use std::time::Duration;

use stop_monitor::ingest::{FrameRead, NetworkOpener, OpenOptions, SourceOpener};
use stop_monitor::{EndpointCandidate, MonitorConfig, Protocol};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Only probe this camera id.
    #[arg(long)]
    camera: Option<String>,
    /// Per-candidate open timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    open_timeout_ms: u64,
    /// Skip stream candidates (RTSP/HLS) and probe snapshot endpoints only.
    #[arg(long)]
    snapshots_only: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Debug, Serialize)]
struct ProbeResult {
    camera_id: String,
    protocol: Protocol,
    url: String,
    ok: bool,
    detail: String,
}

fn probe(opener: &NetworkOpener, candidate: &EndpointCandidate, options: &OpenOptions) -> Result<String> {
    let mut source = opener.open(candidate, options)?;
    let result = match source.next_frame()? {
        FrameRead::Frame(frame) => Ok(format!(
            "{}x{} fps={}",
            frame.width(),
            frame.height(),
            source
                .source_fps()
                .map(|fps| format!("{fps:.1}"))
                .unwrap_or_else(|| "?".to_string())
        )),
        FrameRead::EndOfStream => Err(anyhow!("stream ended before the first frame")),
    };
    source.close();
    result
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let config = MonitorConfig::load()?;
    let registry = config.camera_registry()?;
    let options = OpenOptions {
        open_timeout: Duration::from_millis(args.open_timeout_ms),
        read_timeout: config.ingest.read_timeout,
    };
    let opener = NetworkOpener;

    let mut results = Vec::new();
    for endpoint in registry.iter() {
        if args.camera.as_deref().is_some_and(|id| id != endpoint.camera_id) {
            continue;
        }
        for candidate in &endpoint.candidates {
            if args.snapshots_only && !candidate.protocol.serves_snapshot() {
                continue;
            }
            let step = ui.step(&format!(
                "{} {:?}/{:?}",
                endpoint.camera_id, candidate.protocol, candidate.quality
            ));
            let (ok, detail) = match probe(&opener, candidate, &options) {
                Ok(detail) => {
                    step.ok(&detail);
                    (true, detail)
                }
                Err(err) => {
                    let detail = format!("{:#}", err);
                    step.fail(&detail);
                    (false, detail)
                }
            };
            results.push(ProbeResult {
                camera_id: endpoint.camera_id.clone(),
                protocol: candidate.protocol,
                url: candidate.url.clone(),
                ok,
                detail,
            });
        }
    }
    if results.is_empty() {
        return Err(anyhow!("no candidates matched"));
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    let working = results.iter().filter(|r| r.ok).count();
    eprintln!("{} of {} candidates reachable", working, results.len());
    Ok(())
}
