use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use stop_monitor::config::{DetectorKind, MonitorConfig};
use stop_monitor::ZoneMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "STOP_MONITOR_CONFIG",
        "STOP_MONITOR_DB_PATH",
        "STOP_MONITOR_API_ADDR",
        "STOP_MONITOR_RELAY_ADDR",
        "STOP_MONITOR_INTERVAL_SECS",
        "STOP_MONITOR_WORKERS",
        "STOP_MONITOR_DETECTOR_URL",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
db_path = "stops_prod.db"

[api]
addr = "127.0.0.1:9100"

[relay]
addr = "127.0.0.1:9101"
jpeg_quality = 70

[scheduler]
interval_secs = 120
workers = 8
queue_capacity = 16
task_budget_secs = 20

[ingest]
open_timeout_ms = 1500

[detector]
backend = "remote"
url = "http://127.0.0.1:7000/detect"
confidence_threshold = 0.35

[zone]
mode = "polygon"

[[cameras]]
camera_id = "north"
candidates = [
    { protocol = "snapshot", quality = "standard", url = "https://cams.test/north.jpg" },
]

[[stops]]
id = 1
name = "North Gate"
camera_id = "north"
zone = [[0.0, 0.0], [100.0, 0.0], [100.0, 100.0]]

[[stops]]
id = 2
name = "Depot"
active = false
"#,
    );

    std::env::set_var("STOP_MONITOR_CONFIG", file.path());
    std::env::set_var("STOP_MONITOR_WORKERS", "2");
    std::env::set_var("STOP_MONITOR_DETECTOR_URL", "http://127.0.0.1:7001/detect");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "stops_prod.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:9100");
    assert_eq!(cfg.relay_addr, "127.0.0.1:9101");
    assert_eq!(cfg.relay_jpeg_quality, 70);
    assert_eq!(cfg.scheduler.interval, Duration::from_secs(120));
    assert_eq!(cfg.scheduler.workers, 2);
    assert_eq!(cfg.scheduler.queue_capacity, 16);
    assert_eq!(cfg.scheduler.task_budget, Duration::from_secs(20));
    assert_eq!(cfg.ingest.open_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.ingest.read_timeout, Duration::from_secs(10));
    assert_eq!(cfg.detector.backend, DetectorKind::Remote);
    assert_eq!(cfg.detector.url.as_deref(), Some("http://127.0.0.1:7001/detect"));
    assert!((cfg.detector.confidence_threshold - 0.35).abs() < f32::EPSILON);
    assert_eq!(cfg.zone_mode, ZoneMode::Polygon);
    assert_eq!(cfg.stops.len(), 2);
    assert!(cfg.stops[0].is_pollable());
    assert!(!cfg.stops[1].is_pollable());

    let registry = cfg.camera_registry().expect("registry");
    assert_eq!(registry.len(), 1);
    assert!(registry.contains("north"));

    clear_env();
}

#[test]
fn defaults_without_file_use_builtin_cameras() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "stop_monitor.db");
    assert_eq!(cfg.scheduler.interval, Duration::from_secs(60));
    assert_eq!(cfg.scheduler.workers, 4);
    assert_eq!(cfg.detector.backend, DetectorKind::Stub);
    assert_eq!(cfg.zone_mode, ZoneMode::BoundingBox);
    assert!(cfg.stops.is_empty());
    assert_eq!(cfg.camera_registry().expect("registry").len(), 6);

    clear_env();
}

#[test]
fn json_config_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "db_path": "from_json.db",
            "scheduler": { "interval_secs": 15 },
            "stops": [
                { "id": 7, "camera_id": "camera1", "zone": [[1, 1], [5, 5]] }
            ]
        }"#,
    );
    std::env::set_var("STOP_MONITOR_CONFIG", file.path());

    let cfg = MonitorConfig::load().expect("load json config");
    assert_eq!(cfg.db_path, "from_json.db");
    assert_eq!(cfg.scheduler.interval, Duration::from_secs(15));
    assert_eq!(cfg.stops[0].id, 7);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        "[scheduler]\ninterval_secs = 0\n",
        "[scheduler]\nworkers = 0\n",
        "[scheduler]\ntask_budget_secs = 0\n",
        "[detector]\nbackend = \"remote\"\n",
        "[detector]\nbackend = \"onnx\"\n",
        "[zone]\nmode = \"circle\"\n",
        "[[stops]]\nid = 1\n\n[[stops]]\nid = 1\n",
    ];
    for body in cases {
        let file = write_config(".toml", body);
        std::env::set_var("STOP_MONITOR_CONFIG", file.path());
        assert!(MonitorConfig::load().is_err(), "accepted invalid config:\n{body}");
    }

    clear_env();
    std::env::set_var("STOP_MONITOR_INTERVAL_SECS", "soon");
    assert!(MonitorConfig::load().is_err());

    clear_env();
}
