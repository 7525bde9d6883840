use crate::srv::error::{CommandStatus, ServerError};
use crate::srv::event::event;
use crate::srv::lockfile::LockStore;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopResult {
    Stopped(Pid),
    /// Lock existed but its pid was already gone; the lock has been cleared.
    Stale(Pid),
}

/// Signal the worker recorded for `host:port` and clear its lock.
///
/// The recorded pid is trusted as-is: there is no check that it still belongs to a worker.
pub fn stop_port(locks: &LockStore, host: &str, port: u16) -> Result<StopResult, ServerError> {
    let target = Some((host, port));
    let pid = match locks.read(host, port) {
        Ok(pid) => pid,
        Err(e @ ServerError::InvalidLockFile { .. }) => {
            event("stop", target, format!("{e}; removing it"));
            locks.clear(host, port)?;
            return Err(ServerError::NotRunning {
                host: host.to_string(),
                port,
            });
        }
        Err(e) => return Err(e),
    };

    let result = match kill(pid, Signal::SIGTERM) {
        Ok(()) => StopResult::Stopped(pid),
        Err(Errno::ESRCH) => {
            event("stop", target, format!("pid={pid} is not running; clearing stale lock"));
            StopResult::Stale(pid)
        }
        Err(e) => {
            event("stop", target, format!("kill pid={pid} failed: {e}"));
            StopResult::Stopped(pid)
        }
    };
    locks.clear(host, port)?;
    Ok(result)
}

/// Stop every port in order. Ports that are not running are reported and skipped.
///
/// Returns the pids that were signalled, along with the aggregated per-port failures.
pub fn stop_ports(locks: &LockStore, host: &str, ports: &[u16]) -> (Vec<Pid>, CommandStatus) {
    let mut signalled = Vec::new();
    let mut status = CommandStatus::default();
    for &port in ports {
        match stop_port(locks, host, port) {
            Ok(StopResult::Stopped(pid)) => {
                println!("Server on {host}:{port} stopped.");
                event("stop", Some((host, port)), format!("stopped pid={pid}"));
                signalled.push(pid);
            }
            Ok(StopResult::Stale(pid)) => {
                println!("Server on {host}:{port} stopped.");
                event("stop", Some((host, port)), format!("stale lock cleared pid={pid}"));
            }
            Err(e @ ServerError::NotRunning { .. }) => {
                println!("Server on {host}:{port} is not running.");
                status.record(e);
            }
            Err(e) => {
                event("stop", Some((host, port)), format!("{e}"));
                status.record(e);
            }
        }
    }
    (signalled, status)
}

/// Whether `pid` names a live process. Zombies count as gone.
///
/// EPERM means the process exists but belongs to another user, so it counts as alive.
pub fn pid_alive(pid: Pid) -> bool {
    if let Err(Errno::ESRCH) = kill(pid, None) {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // Format: "pid (comm) S ...". comm may contain spaces, so split after the last ')'.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map(|state| state != 'Z' && state != 'X')
            .unwrap_or(true),
        Err(_) => true,
    }
}

/// Poll until every pid is gone or `timeout` elapses. Returns the pids still alive.
pub fn wait_gone(pids: &[Pid], timeout: Duration) -> Vec<Pid> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<Pid> = pids.iter().copied().filter(|p| pid_alive(*p)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
