//! Sidecar Lifecycle Manager
//!
//! Finds, verifies, spawns and stops the scoring sidecar. Authority for
//! "is a sidecar already running" lives in the PID and port markers, which
//! are never trusted without a protocol-level ping against the recorded
//! port. A process is never signalled during discovery; stale or foreign
//! markers are simply discarded.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{HologramConfig, TimeoutConfig};
use crate::error::{HologramError, HologramResult};
use crate::markers::MarkerFiles;
use crate::process;
use crate::protocol::{Request, ResponseType};
use crate::transport::{localhost, send};

/// Upper bound on reaping a child after it was killed.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of challenging whatever listens on a recorded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Answered `pong` with our correlation id
    Ours,
    /// Something answered, but not correctly or not in time
    Foreign,
    /// Nothing listening
    Dead,
}

/// What `stop()` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Graceful,
    Forced,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRunning => "not running",
            Self::Graceful => "stopped",
            Self::Forced => "killed",
        }
    }
}

/// Program, arguments and working directory used to launch the sidecar.
#[derive(Debug, Clone)]
pub struct SidecarCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl SidecarCommand {
    /// `[interpreter] path --port-file <port marker> [--config <file>]`,
    /// run from the directory holding `path`.
    pub fn from_config(config: &HologramConfig) -> Self {
        let script = config.sidecar.path.clone();
        let mut args = Vec::new();

        let program = match &config.sidecar.interpreter {
            Some(interpreter) => {
                args.push(script.clone().into_os_string());
                OsString::from(interpreter)
            }
            None => script.clone().into_os_string(),
        };

        args.push(OsString::from("--port-file"));
        args.push(config.port_file().into_os_string());
        if let Some(source) = &config.source_path {
            args.push(OsString::from("--config"));
            args.push(source.clone().into_os_string());
        }

        let working_dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from);

        Self {
            program,
            args,
            working_dir,
        }
    }
}

/// Process-local view of the sidecar this invocation spawned or found.
#[derive(Debug, Default)]
struct ProcessHandle {
    child: Option<Child>,
    last_known_pid: Option<u32>,
    last_known_port: Option<u16>,
}

impl ProcessHandle {
    /// Reap-aware liveness: our own child may linger as a zombie that
    /// `kill(pid, 0)` still reports as alive.
    fn is_alive(&mut self, pid: u32) -> bool {
        if let Some(child) = self.child.as_mut() {
            if child.id() == Some(pid) {
                return match child.try_wait() {
                    Ok(Some(_)) => {
                        self.child = None;
                        false
                    }
                    Ok(None) => true,
                    Err(_) => process::is_alive(pid),
                };
            }
        }
        process::is_alive(pid)
    }
}

enum StartupEvent {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Tick,
}

pub struct LifecycleManager {
    markers: MarkerFiles,
    command: SidecarCommand,
    log_path: PathBuf,
    timeouts: TimeoutConfig,
    handle: Mutex<ProcessHandle>,
}

impl LifecycleManager {
    pub fn new(config: &HologramConfig) -> Self {
        Self {
            markers: MarkerFiles::from_config(config),
            command: SidecarCommand::from_config(config),
            log_path: config.log_file(),
            timeouts: config.timeouts.clone(),
            handle: Mutex::new(ProcessHandle::default()),
        }
    }

    pub fn markers(&self) -> &MarkerFiles {
        &self.markers
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    /// Return the port of a verified sidecar, spawning one if needed.
    ///
    /// Only a failed spawn is an error; every discovery problem is
    /// resolved by discarding markers and spawning fresh.
    pub async fn start(&self) -> HologramResult<u16> {
        let mut handle = self.handle.lock().await;
        if let (Some(pid), Some(port)) = (handle.last_known_pid, handle.last_known_port) {
            tracing::trace!(pid, port, "Re-verifying sidecar from earlier start");
        }

        if let Some(port) = self.discover_running().await {
            handle.last_known_port = Some(port);
            handle.last_known_pid = self.markers.read_pid();
            return Ok(port);
        }

        self.spawn(&mut handle).await
    }

    /// Whether the PID marker names a live process. No network probe.
    pub fn is_running(&self) -> bool {
        self.markers.read_pid().is_some_and(process::is_alive)
    }

    /// The recorded port, if the recorded process is alive.
    pub fn get_port(&self) -> Option<u16> {
        if self.is_running() {
            self.markers.read_port()
        } else {
            None
        }
    }

    /// Ping `port` with the probe timeout.
    pub async fn verify_identity(&self, port: u16) -> Identity {
        let request = Request::ping();
        match send(localhost(port), &request, self.timeouts.probe()).await {
            Ok(response) if response.kind == ResponseType::Pong => Identity::Ours,
            Ok(response) => {
                tracing::debug!(port, kind = ?response.kind, "Port answered ping without pong");
                Identity::Foreign
            }
            Err(e) if e.is_unavailable() => Identity::Dead,
            Err(e) => {
                tracing::debug!(port, error = %e, "Identity probe failed");
                Identity::Foreign
            }
        }
    }

    /// Terminate the recorded process: SIGTERM, then SIGKILL after the
    /// grace period. Markers are removed in every case.
    pub async fn stop(&self) -> StopOutcome {
        let mut handle = self.handle.lock().await;

        let Some(pid) = self.markers.read_pid() else {
            self.markers.clear();
            return StopOutcome::NotRunning;
        };
        if !handle.is_alive(pid) {
            tracing::debug!(pid, "Recorded sidecar already gone");
            self.markers.clear();
            return StopOutcome::NotRunning;
        }

        tracing::info!(pid, "Stopping sidecar");
        if let Err(e) = process::terminate(pid) {
            tracing::warn!(pid, error = %e, "Failed to send SIGTERM");
        }

        let outcome = if self.wait_for_exit(&mut handle, pid, self.timeouts.stop_grace()).await {
            StopOutcome::Graceful
        } else {
            tracing::warn!(pid, "Sidecar ignored SIGTERM, killing");
            if let Err(e) = process::force_kill(pid) {
                tracing::warn!(pid, error = %e, "Failed to send SIGKILL");
            }
            self.wait_for_exit(&mut handle, pid, REAP_TIMEOUT).await;
            StopOutcome::Forced
        };

        self.markers.clear();
        *handle = ProcessHandle::default();
        outcome
    }

    /// Kill and reap a child left mid-startup by an abandoned `start()`.
    ///
    /// Markers are cleared only while the PID marker still names that child.
    /// Returns the PID that was killed.
    pub async fn abort_spawn(&self) -> Option<u32> {
        let mut handle = self.handle.lock().await;
        let mut child = handle.child.take()?;
        let pid = child.id();

        if let Err(e) = child.start_kill() {
            tracing::debug!(?pid, error = %e, "Abandoned sidecar already exited");
        }
        if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
            tracing::warn!(?pid, "Abandoned sidecar not reaped in time");
        }

        if pid.is_some() && self.markers.read_pid() == pid {
            self.markers.clear();
        }
        tracing::info!(?pid, log = %self.log_path.display(), "Killed sidecar abandoned during startup");
        *handle = ProcessHandle::default();
        pid
    }

    async fn wait_for_exit(&self, handle: &mut ProcessHandle, pid: u32, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if !handle.is_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timeouts.poll_interval()).await;
        }
    }

    /// Resolve the markers to a verified port, discarding whatever is stale.
    async fn discover_running(&self) -> Option<u16> {
        let pid = self.markers.read_pid();
        let alive = pid.is_some_and(process::is_alive);
        let mut port = self.markers.read_port();

        if alive && port.is_none() {
            // A concurrent spawner writes the PID before the port
            tokio::time::sleep(self.timeouts.probe()).await;
            port = self.markers.read_port();
        }

        let Some(port) = port else {
            if pid.is_some() {
                tracing::info!(?pid, alive, "No port marker for recorded sidecar, discarding markers");
            }
            self.markers.clear();
            return None;
        };

        match self.verify_identity(port).await {
            Identity::Ours if alive => {
                tracing::debug!(?pid, port, "Reusing running sidecar");
                Some(port)
            }
            Identity::Ours => {
                // Orphan whose PID we no longer know: ask it to leave
                tracing::info!(?pid, port, "Sidecar answering on port without a live PID, shutting it down");
                if let Err(e) = send(localhost(port), &Request::shutdown(), self.timeouts.probe()).await {
                    tracing::debug!(port, error = %e, "Orphan shutdown request failed");
                }
                self.markers.clear();
                None
            }
            Identity::Foreign => {
                tracing::warn!(?pid, port, "Port marker points at a foreign listener, discarding markers");
                self.markers.clear();
                None
            }
            Identity::Dead => {
                tracing::info!(?pid, port, "Stale sidecar markers, discarding");
                self.markers.clear();
                None
            }
        }
    }

    async fn spawn(&self, handle: &mut ProcessHandle) -> HologramResult<u16> {
        self.markers.clear_port();

        let log = self.open_log()?;
        let log_err = log
            .try_clone()
            .map_err(|e| self.spawn_error(format!("cannot duplicate log handle: {e}")))?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);
        if let Some(dir) = &self.command.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            self.spawn_error(format!(
                "cannot execute {}: {e}",
                self.command.program.to_string_lossy()
            ))
        })?;

        let Some(pid) = child.id() else {
            return Err(self.spawn_error("sidecar exited immediately"));
        };
        tracing::info!(pid, program = %self.command.program.to_string_lossy(), "Spawned sidecar");

        if let Err(e) = self.markers.write_pid(pid) {
            let _ = child.start_kill();
            return Err(self.spawn_error(format!("cannot write PID marker: {e}")));
        }

        handle.last_known_pid = Some(pid);
        handle.child = Some(child);

        let port = self.wait_for_ready(handle).await?;
        handle.last_known_port = Some(port);
        tracing::info!(pid, port, "Sidecar ready");
        Ok(port)
    }

    /// Poll for the port marker until the startup deadline.
    async fn wait_for_ready(&self, handle: &mut ProcessHandle) -> HologramResult<u16> {
        let Some(child) = handle.child.as_mut() else {
            return Err(self.spawn_error("no child process to wait for"));
        };

        let deadline = tokio::time::sleep(self.timeouts.startup());
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.timeouts.poll_interval());

        loop {
            let event = tokio::select! {
                status = child.wait() => StartupEvent::Exited(status),
                _ = &mut deadline => StartupEvent::Deadline,
                _ = ticker.tick() => StartupEvent::Tick,
            };

            match event {
                StartupEvent::Tick => {
                    if let Some(port) = self.markers.read_port() {
                        return Ok(port);
                    }
                }
                StartupEvent::Exited(status) => {
                    handle.child = None;
                    self.markers.clear();
                    let reason = match status {
                        Ok(status) => format!("sidecar exited before becoming ready ({status})"),
                        Err(e) => format!("lost track of sidecar during startup: {e}"),
                    };
                    tracing::error!(log = %self.log_path.display(), "{reason}");
                    return Err(self.spawn_error(reason));
                }
                StartupEvent::Deadline => {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
                    handle.child = None;
                    self.markers.clear();
                    let reason = format!(
                        "sidecar did not publish a port within {}ms",
                        self.timeouts.startup_ms
                    );
                    tracing::error!(log = %self.log_path.display(), "{reason}");
                    return Err(self.spawn_error(reason));
                }
            }
        }
    }

    fn open_log(&self) -> HologramResult<std::fs::File> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| self.spawn_error(format!("cannot create {}: {e}", parent.display())))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| self.spawn_error(format!("cannot open log file: {e}")))
    }

    fn spawn_error(&self, reason: impl Into<String>) -> HologramError {
        HologramError::spawn_failure(reason, &self.log_path)
    }
}
