//! Read-only record API.
//!
//! A small loopback HTTP/1.1 listener on its own thread, with its own store connection:
//! - `GET /health`
//! - `GET /violations` (newest first; `?pending=1` for records awaiting analysis)
//! - `GET /violations/latest`

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::analysis::summary_line;
use crate::storage::{SqliteViolationStore, ViolationRecord, ViolationStore};

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub db_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8799".to_string(),
            db_path: "illegal_vehicles.db".to_string(),
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

/// A record plus the one-line preview of its analysis.
#[derive(Debug, Serialize)]
struct RecordView<'a> {
    #[serde(flatten)]
    record: &'a ViolationRecord,
    summary: Option<&'a str>,
}

impl<'a> RecordView<'a> {
    fn new(record: &'a ViolationRecord) -> Self {
        Self {
            record,
            summary: record.analysis_result.as_deref().map(summary_line),
        }
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        if !configured_addr.ip().is_loopback() {
            return Err(anyhow!(
                "record api must bind to a loopback address, got '{}'",
                configured_addr
            ));
        }
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        // Open eagerly so a bad path fails the spawn instead of the thread.
        let store = SqliteViolationStore::open(&self.cfg.db_path)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, store, shutdown_thread) {
                log::error!("record api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    mut store: SqliteViolationStore,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &mut store) {
                    log::warn!("record api request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, store: &mut dyn ViolationStore) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    if !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/violations" => {
            let records = if request.query_flag("pending") {
                store.list_pending()?
            } else {
                store.list_all()?
            };
            let views: Vec<RecordView<'_>> = records.iter().map(RecordView::new).collect();
            let payload = serde_json::to_vec(&views)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/violations/latest" => match store.latest()? {
            Some(record) => {
                let payload = serde_json::to_vec(&RecordView::new(&record))?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"no_violations"}"#),
        },
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
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
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;

    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    let query = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
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
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
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
    fn query_flag(&self, key: &str) -> bool {
        matches!(self.query.get(key).map(String::as_str), Some("1" | "true" | ""))
    }
}
