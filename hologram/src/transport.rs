//! Sidecar Transport Layer
//!
//! One fresh TCP connection per exchange: connect, write one JSON line, read
//! one JSON line back, close. No pooling; callers are short-lived.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{HologramError, HologramResult};
use crate::protocol::{Request, Response};

/// Upper bound on a single response line.
const MAX_RESPONSE_BYTES: u64 = 16 * 1024 * 1024;

/// Sidecar address on the loopback interface.
pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Send one request and wait for its matching response.
///
/// The whole exchange (connect, write, read) shares `timeout`. The returned
/// response always carries the request's id; anything else is an error.
pub async fn send(
    target: SocketAddr,
    request: &Request,
    timeout: Duration,
) -> HologramResult<Response> {
    match tokio::time::timeout(timeout, exchange(target, request)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(
                %target,
                request_id = %request.id,
                kind = request.kind.as_str(),
                "Sidecar request timed out"
            );
            Err(HologramError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

async fn exchange(target: SocketAddr, request: &Request) -> HologramResult<Response> {
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| connect_error(target, e))?;

    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_vec(request)
        .map_err(|e| HologramError::protocol(format!("failed to encode request: {e}")))?;
    line.push(b'\n');

    tracing::trace!(%target, request_id = %request.id, kind = request.kind.as_str(), "Sending");
    writer.write_all(&line).await.map_err(HologramError::Transport)?;
    writer.flush().await.map_err(HologramError::Transport)?;

    let mut reader = BufReader::new(reader).take(MAX_RESPONSE_BYTES);
    let mut buf = Vec::new();
    let bytes_read = reader
        .read_until(b'\n', &mut buf)
        .await
        .map_err(HologramError::Transport)?;

    if bytes_read == 0 {
        return Err(HologramError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "sidecar closed the connection before responding",
        )));
    }
    if buf.last() != Some(&b'\n') && bytes_read as u64 >= MAX_RESPONSE_BYTES {
        return Err(HologramError::protocol(format!(
            "response exceeds {MAX_RESPONSE_BYTES} bytes without a newline"
        )));
    }

    parse_response(&buf, request)
}

/// Decode a response line and check it answers `request`.
fn parse_response(line: &[u8], request: &Request) -> HologramResult<Response> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let response: Response = serde_json::from_slice(line)
        .map_err(|e| HologramError::protocol(format!("malformed response: {e}")))?;

    if response.id != request.id {
        return Err(HologramError::protocol(format!(
            "response id {:?} does not match request id {:?}",
            response.id, request.id
        )));
    }

    Ok(response)
}

fn connect_error(target: SocketAddr, err: io::Error) -> HologramError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => {
            HologramError::unavailable(format!("nothing listening on {target}"))
        }
        _ => HologramError::Transport(err),
    }
}
