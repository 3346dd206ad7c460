//! Sidecar TCP server speaking the NDJSON protocol.
//!
//! Each connection receives one request, gets routed, receives one response
//! and is closed. Scoring itself is delegated to a [`QueryHandler`].

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::scan::ProjectScanner;
use crate::config::ProjectScanConfig;
use crate::protocol::{QueryPayload, Response};

/// How long a connection may take to send its request line.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest request line read; anything past it is cut off and fails to parse.
const MAX_REQUEST_BYTES: u64 = 4 * 1024 * 1024;

/// Everything a handler sees for one `query`.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub payload: QueryPayload,
    /// `project:<relative path>` -> content, empty without a project dir
    pub project_files: BTreeMap<String, String>,
}

/// The scoring engine behind the sidecar.
///
/// Called on a blocking thread. `Ok` becomes the `result` payload, `Err`
/// becomes an `error` response carrying the message.
pub trait QueryHandler: Send + Sync + 'static {
    fn handle_query(&self, query: &QueryContext) -> Result<Value, String>;
}

/// Stops a running [`SidecarServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct SidecarServer {
    listener: TcpListener,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SidecarServer {
    /// Bind the listener. Port 0 lets the OS pick.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, _rx) = watch::channel(false);
        Ok(Self {
            listener,
            shutdown_tx: Arc::new(tx),
        })
    }

    /// The port actually bound.
    pub fn port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Accept connections until a `shutdown` request or handle fires.
    pub async fn serve<H: QueryHandler>(self, handler: H) -> std::io::Result<()> {
        let handler = Arc::new(handler);
        let scanner = Arc::new(ProjectScanner::new());
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tracing::info!(port = self.port()?, "Sidecar server listening");

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&handler);
                            let scanner = Arc::clone(&scanner);
                            let shutdown = Arc::clone(&self.shutdown_tx);
                            tokio::spawn(async move {
                                handle_connection(stream, peer, handler, scanner, shutdown).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        tracing::info!("Sidecar server shut down");
        Ok(())
    }
}

async fn handle_connection<H: QueryHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    scanner: Arc<ProjectScanner>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    tracing::debug!(%peer, "Connection");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(MAX_REQUEST_BYTES);
    let mut line = String::new();

    let response = match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Err(_) => {
            tracing::warn!(%peer, "Connection timed out reading request");
            return;
        }
        Ok(Ok(0)) => return,
        Ok(Err(e)) => Some((
            Response::error("unknown", format!("Internal server error: {e}")),
            false,
        )),
        Ok(Ok(_)) => None,
    };

    let (response, is_shutdown) = match response {
        Some(early) => early,
        None => {
            let text = line.trim();
            if text.is_empty() {
                return;
            }
            match serde_json::from_str::<Value>(text) {
                Err(e) => (Response::error("unknown", format!("Malformed JSON: {e}")), false),
                Ok(value) => {
                    let started = Instant::now();
                    let (mut response, is_shutdown) = route_request(value, handler, scanner).await;
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    response.timing_ms = Some((elapsed_ms * 10.0).round() / 10.0);
                    (response, is_shutdown)
                }
            }
        }
    };

    match serde_json::to_vec(&response) {
        Ok(mut bytes) => {
            bytes.push(b'\n');
            if let Err(e) = writer.write_all(&bytes).await {
                tracing::warn!(%peer, error = %e, "Failed to send response");
            }
            let _ = writer.shutdown().await;
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode response"),
    }

    if is_shutdown {
        tracing::info!("Shutdown requested by client");
        shutdown.send_replace(true);
    }
}

/// Route one decoded request. The flag is set for `shutdown`.
async fn route_request<H: QueryHandler>(
    value: Value,
    handler: Arc<H>,
    scanner: Arc<ProjectScanner>,
) -> (Response, bool) {
    let Value::Object(request) = value else {
        let mut response = Response::error("unknown", "invalid request format");
        response.payload = json!({"error": "invalid request format", "code": "BAD_REQUEST"});
        return (response, false);
    };

    let id = match request.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return (Response::error("unknown", "Missing 'id' field"), false),
    };
    let Some(kind) = request.get("type").and_then(Value::as_str) else {
        return (Response::error(id, "Missing 'type' field"), false);
    };

    match kind {
        "ping" => (Response::pong(id), false),
        "update" => (Response::result(id, Value::Object(Map::new())), false),
        "shutdown" => (Response::result(id, Value::Object(Map::new())), true),
        "query" => {
            let payload = request.get("payload").cloned().unwrap_or(Value::Null);
            (handle_query(id, payload, handler, scanner).await, false)
        }
        other => (
            Response::error(id, format!("Unknown request type: {other}")),
            false,
        ),
    }
}

async fn handle_query<H: QueryHandler>(
    id: String,
    payload: Value,
    handler: Arc<H>,
    scanner: Arc<ProjectScanner>,
) -> Response {
    let payload: QueryPayload = match payload {
        Value::Null => QueryPayload::default(),
        other => match serde_json::from_value(other) {
            Ok(p) => p,
            Err(e) => return Response::error(id, format!("Invalid query payload: {e}")),
        },
    };

    tracing::debug!(
        prompt_len = payload.prompt.len(),
        project_dir = payload.project_dir.as_deref().unwrap_or("(global)"),
        "Query received"
    );

    // Scan outside the handler: I/O heavy, no session state involved
    let project_files = match payload.project_dir.as_deref().map(PathBuf::from) {
        Some(dir) if dir.is_dir() => {
            let config = payload.project_config.clone().unwrap_or_else(ProjectScanConfig::default);
            tokio::task::spawn_blocking(move || scanner.scan(&dir, &config))
                .await
                .unwrap_or_default()
        }
        _ => BTreeMap::new(),
    };

    let context = QueryContext {
        payload,
        project_files,
    };
    match tokio::task::spawn_blocking(move || handler.handle_query(&context)).await {
        Ok(Ok(result)) => Response::result(id, result),
        Ok(Err(message)) => Response::error(id, message),
        Err(e) => {
            tracing::error!(error = %e, "Query handler panicked");
            Response::error(id, format!("Internal server error: {e}"))
        }
    }
}
