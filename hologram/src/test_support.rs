//! Shared fixtures for unit tests: scripted TCP peers and a stub sidecar.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::Request;
use crate::sidecar::{QueryContext, QueryHandler, ShutdownHandle, SidecarServer};
use crate::transport::localhost;

/// How a scripted peer answers each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Well-formed pong echoing the request id
    Pong,
    /// Pong with a different id
    WrongId,
    /// A line that is not JSON
    Garbage,
    /// Accept, read, never answer
    Silent,
    /// Close without writing anything
    HangUp,
    /// Pong delivered in two writes
    SplitPong,
}

/// Start a peer on an ephemeral port. Runs until the test runtime ends.
pub async fn spawn_peer(behavior: PeerBehavior) -> u16 {
    let listener = TcpListener::bind(localhost(0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(answer(stream, behavior));
        }
    });
    port
}

async fn answer(stream: TcpStream, behavior: PeerBehavior) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }
    let id = serde_json::from_str::<Request>(line.trim())
        .map(|r| r.id)
        .unwrap_or_default();

    match behavior {
        PeerBehavior::Pong => {
            let reply = pong_line(&id);
            let _ = writer.write_all(reply.as_bytes()).await;
        }
        PeerBehavior::WrongId => {
            let reply = pong_line("someone-else");
            let _ = writer.write_all(reply.as_bytes()).await;
        }
        PeerBehavior::Garbage => {
            let _ = writer.write_all(b"not json\n").await;
        }
        PeerBehavior::Silent => {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        PeerBehavior::HangUp => {}
        PeerBehavior::SplitPong => {
            let reply = pong_line(&id);
            let (head, tail) = reply.split_at(reply.len() / 2);
            let _ = writer.write_all(head.as_bytes()).await;
            let _ = writer.flush().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = writer.write_all(tail.as_bytes()).await;
        }
    }
    let _ = writer.shutdown().await;
}

fn pong_line(id: &str) -> String {
    format!("{}\n", json!({"id": id, "type": "pong", "payload": {}}))
}

/// A loopback port with nothing listening on it.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind(localhost(0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Handler with canned behavior for server tests.
pub struct StubHandler {
    reply: Result<Value, String>,
    echo_files: bool,
}

impl StubHandler {
    pub fn new(reply: Value) -> Self {
        Self {
            reply: Ok(reply),
            echo_files: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(json!({"hot": [], "warm": [], "cold": []}))
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            echo_files: false,
        }
    }

    /// Replies with the scanned project file keys under `files`.
    pub fn echo_project_files() -> Self {
        Self {
            reply: Ok(Value::Null),
            echo_files: true,
        }
    }
}

impl QueryHandler for StubHandler {
    fn handle_query(&self, query: &QueryContext) -> Result<Value, String> {
        if self.echo_files {
            let files: Vec<&String> = query.project_files.keys().collect();
            return Ok(json!({ "files": files }));
        }
        self.reply.clone()
    }
}

/// Run a sidecar server on an ephemeral port.
pub async fn spawn_sidecar<H: QueryHandler>(handler: H) -> (u16, ShutdownHandle) {
    let server = SidecarServer::bind(localhost(0)).await.unwrap();
    let port = server.port().unwrap();
    let handle = server.shutdown_handle();
    tokio::spawn(server.serve(handler));
    (port, handle)
}
