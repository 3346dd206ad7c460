//! Error types for the hologram sidecar client.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while talking to or supervising the sidecar.
#[derive(Debug, Error)]
pub enum HologramError {
    /// Nothing reachable: refused connection, dead process, startup timeout.
    #[error("Sidecar unavailable: {0}")]
    Unavailable(String),

    /// Reachable but no answer within the deadline.
    #[error("Sidecar timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Malformed payload or correlation id mismatch.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Any other socket-level failure.
    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// Executable missing, permission denied, or exited before becoming ready.
    #[error("Failed to spawn sidecar: {reason} (see {})", .log_path.display())]
    SpawnFailure { reason: String, log_path: PathBuf },

    /// The sidecar answered with an `error` response.
    #[error("Sidecar error: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HologramError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub fn spawn_failure(reason: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self::SpawnFailure {
            reason: reason.into(),
            log_path: log_path.into(),
        }
    }

    /// Whether this error means no sidecar is listening at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::SpawnFailure { .. })
    }
}

/// Result type alias for sidecar operations.
pub type HologramResult<T> = Result<T, HologramError>;
