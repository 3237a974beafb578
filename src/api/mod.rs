//! Thin loopback HTTP surface: health, stats, manual poll triggers and
//! read-only views of persisted results.

use crate::forecast::ForecastProvider;
use crate::model::StopId;
use crate::now_ms;
use crate::scheduler::PollingScheduler;
use crate::storage::ResultWriter;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const FORECAST_HISTORY_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const DEFAULT_FORECAST_HOURS: u32 = 24;
const MAX_FORECAST_HOURS: u32 = 168;
const DEFAULT_SIGHTING_WINDOW_SECS: i64 = 120;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8790".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    routes: Routes,
}

struct Routes {
    scheduler: Arc<PollingScheduler>,
    writer: ResultWriter,
    forecaster: Option<Arc<dyn ForecastProvider>>,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        scheduler: Arc<PollingScheduler>,
        writer: ResultWriter,
        forecaster: Option<Arc<dyn ForecastProvider>>,
    ) -> Self {
        Self {
            cfg,
            routes: Routes {
                scheduler,
                writer,
                forecaster,
            },
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let routes = self.routes;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, routes, shutdown_thread) {
                log::error!("monitor api stopped: {}", err);
            }
        });
        log::info!("monitor api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, routes: Routes, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &routes) {
                    log::warn!("monitor api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, routes: &Routes) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }
    stream.set_nonblocking(false)?;

    let request = read_request(&mut stream)?;
    let (status, body) = match routes.dispatch(&request) {
        Ok(reply) => reply,
        Err(err) => {
            log::error!("{} {} failed: {:#}", request.method, request.path, err);
            (500, json!({"error": "internal", "message": format!("{:#}", err)}))
        }
    };
    let payload = serde_json::to_vec(&body)?;
    write_response(&mut stream, status, "application/json", &payload)?;
    Ok(())
}

impl Routes {
    fn dispatch(&self, request: &HttpRequest) -> Result<(u16, serde_json::Value)> {
        let segments: Vec<&str> = request
            .path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let method = request.method.as_str();
        match (method, segments.as_slice()) {
            ("GET", ["health"]) => Ok((200, json!({"status": "ok"}))),
            ("GET", ["stats"]) => Ok((200, serde_json::to_value(self.scheduler.stats())?)),
            ("POST", ["poll"]) => {
                let outcomes = self.scheduler.poll_all_now()?;
                Ok((200, json!({ "outcomes": outcomes })))
            }
            ("POST", ["poll", id]) => {
                let Some(stop_id) = parse_stop_id(id) else {
                    return Ok(bad_request("invalid stop id"));
                };
                let outcome = self.scheduler.poll_now(stop_id);
                Ok((200, serde_json::to_value(outcome)?))
            }
            ("GET", ["stops", id, "latest"]) => {
                let Some(stop_id) = parse_stop_id(id) else {
                    return Ok(bad_request("invalid stop id"));
                };
                let mut store = self.writer.open_store()?;
                match store.latest_load(stop_id)? {
                    Some(load) => Ok((200, serde_json::to_value(load)?)),
                    None => Ok((404, json!({"error": "no_records"}))),
                }
            }
            ("GET", ["stops", id, "sightings"]) => {
                let Some(stop_id) = parse_stop_id(id) else {
                    return Ok(bad_request("invalid stop id"));
                };
                let window_secs = match request.query_param("window_secs") {
                    Some(raw) => match raw.parse::<i64>() {
                        Ok(secs) if secs > 0 => secs,
                        _ => return Ok(bad_request("window_secs must be a positive integer")),
                    },
                    None => DEFAULT_SIGHTING_WINDOW_SECS,
                };
                let mut store = self.writer.open_store()?;
                let sightings = store.recent_sightings(stop_id, now_ms() - window_secs * 1000)?;
                Ok((200, json!({ "stop_id": stop_id, "sightings": sightings })))
            }
            ("GET", ["stops", id, "forecast"]) => {
                let Some(stop_id) = parse_stop_id(id) else {
                    return Ok(bad_request("invalid stop id"));
                };
                let hours = match request.query_param("hours") {
                    Some(raw) => match raw.parse::<u32>() {
                        Ok(h) if (1..=MAX_FORECAST_HOURS).contains(&h) => h,
                        _ => return Ok(bad_request("hours must be within 1..=168")),
                    },
                    None => DEFAULT_FORECAST_HOURS,
                };
                let Some(forecaster) = &self.forecaster else {
                    return Ok((503, json!({"error": "forecast_unavailable"})));
                };
                let mut store = self.writer.open_store()?;
                let series = store.hourly_people_series(stop_id, now_ms() - FORECAST_HISTORY_MS)?;
                if series.is_empty() {
                    return Ok((404, json!({"error": "no_history"})));
                }
                match forecaster.forecast(&series, hours) {
                    Ok(points) => Ok((200, json!({ "stop_id": stop_id, "forecast": points }))),
                    Err(err) => {
                        log::warn!("stop {}: forecast failed: {:#}", stop_id, err);
                        Ok((503, json!({"error": "forecast_failed"})))
                    }
                }
            }
            (_, ["health"] | ["stats"] | ["poll"] | ["poll", _] | ["stops", _, _]) => {
                Ok((405, json!({"error": "method_not_allowed"})))
            }
            _ => Ok((404, json!({"error": "not_found"}))),
        }
    }
}

fn parse_stop_id(value: &str) -> Option<StopId> {
    value.parse::<StopId>().ok()
}

fn bad_request(message: &str) -> (u16, serde_json::Value) {
    (400, json!({"error": "bad_request", "message": message}))
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(|v| v.trim())
    }
}
