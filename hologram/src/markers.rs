//! PID and port marker files.
//!
//! The markers are the only state shared between caller invocations. Every
//! value read here is untrusted: a PID may have been recycled and a port may
//! now belong to someone else, so callers verify before acting on either.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::HologramConfig;

/// The pair of marker files describing a sidecar instance.
#[derive(Debug, Clone)]
pub struct MarkerFiles {
    pid_path: PathBuf,
    port_path: PathBuf,
}

impl MarkerFiles {
    pub fn new(pid_path: impl Into<PathBuf>, port_path: impl Into<PathBuf>) -> Self {
        Self {
            pid_path: pid_path.into(),
            port_path: port_path.into(),
        }
    }

    pub fn from_config(config: &HologramConfig) -> Self {
        Self::new(config.pid_file(), config.port_file())
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Recorded PID, if the marker exists and holds a positive integer.
    pub fn read_pid(&self) -> Option<u32> {
        read_number::<u32>(&self.pid_path).filter(|pid| *pid > 0)
    }

    /// Recorded port, if the marker exists and holds a valid non-zero port.
    pub fn read_port(&self) -> Option<u16> {
        read_number::<u16>(&self.port_path).filter(|port| *port > 0)
    }

    pub fn write_pid(&self, pid: u32) -> io::Result<()> {
        write_number(&self.pid_path, pid)
    }

    pub fn write_port(&self, port: u16) -> io::Result<()> {
        write_number(&self.port_path, port)
    }

    pub fn clear_pid(&self) {
        remove_marker(&self.pid_path);
    }

    pub fn clear_port(&self) {
        remove_marker(&self.port_path);
    }

    /// Remove both markers. Missing files are fine.
    pub fn clear(&self) {
        self.clear_pid();
        self.clear_port();
    }
}

fn read_number<T: FromStr>(path: &Path) -> Option<T> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Unreadable marker");
            return None;
        }
    };

    match text.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::debug!(path = %path.display(), contents = %text.trim(), "Invalid marker contents");
            None
        }
    }
}

fn write_number<T: std::fmt::Display>(path: &Path, value: T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, value.to_string())
}

fn remove_marker(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed marker"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove marker"),
    }
}
