//! OS process primitives: liveness probes and signals.
//!
//! Isolated here so the lifecycle manager stays platform-agnostic.

use std::io;

/// Whether a process with this PID currently exists.
///
/// Uses `kill(pid, 0)`. EPERM means the process exists but belongs to
/// someone else, which still counts as alive.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Ask the process to exit (SIGTERM).
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Kill the process outright (SIGKILL).
#[cfg(unix)]
pub fn force_kill(pid: u32) -> io::Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
    let target = to_pid(pid).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}"))
    })?;
    nix::sys::signal::kill(target, signal).map_err(io::Error::from)
}

/// PIDs 0 and anything above `i32::MAX` would address process groups.
#[cfg(unix)]
fn to_pid(pid: u32) -> Option<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(nix::unistd::Pid::from_raw(raw)),
        _ => None,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot signal pid {pid} on this platform"),
    ))
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> io::Result<()> {
    terminate(pid)
}
