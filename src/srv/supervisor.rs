use crate::srv::config::RestartPolicy;
use crate::srv::error::ServerError;
use crate::srv::event::event;
use crate::srv::lockfile::LockStore;
use crate::srv::spawner::{Spawner, WorkerHandle, WorkerSpec};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a tracked worker ended, as seen by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    ExitedOk,
    ExitedError(i32),
    Killed(Signal),
    /// waitpid reported the pid is not our child any more.
    Vanished,
}

impl WorkerExit {
    fn is_failure(&self) -> bool {
        !matches!(self, WorkerExit::ExitedOk)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::ExitedOk => f.write_str("exit=0"),
            WorkerExit::ExitedError(code) => write!(f, "exit={code}"),
            WorkerExit::Killed(sig) => write!(f, "signal={sig}"),
            WorkerExit::Vanished => f.write_str("vanished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Running,
    ShutDown,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub policy: RestartPolicy,
    pub poll_interval: Duration,
    pub restart_backoff: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Always,
            poll_interval: Duration::from_millis(200),
            restart_backoff: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub spawned: usize,
    pub exits: usize,
}

/// Route SIGTERM and SIGINT into `flag`. The handler only stores to the flag; all process and
/// filesystem work happens in [`Supervisor::tick`].
pub fn install_shutdown_handlers(flag: &Arc<AtomicBool>) -> Result<(), ServerError> {
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(sig, Arc::clone(flag))
            .map_err(|e| ServerError::CapabilityMissing(format!("cannot install signal handler {sig}: {e}")))?;
    }
    Ok(())
}

/// Parent-side loop that keeps workers alive until a shutdown is requested.
pub struct Supervisor<'a> {
    spawner: &'a Spawner,
    locks: &'a LockStore,
    table: HashMap<Pid, WorkerHandle>,
    pending: Vec<(WorkerSpec, Instant)>,
    shutdown: Arc<AtomicBool>,
    opts: SupervisorOptions,
    stats: HashMap<(String, u16), PortStats>,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        spawner: &'a Spawner,
        locks: &'a LockStore,
        handles: Vec<WorkerHandle>,
        shutdown: Arc<AtomicBool>,
        opts: SupervisorOptions,
    ) -> Self {
        let mut stats: HashMap<(String, u16), PortStats> = HashMap::new();
        let mut table = HashMap::new();
        for h in handles {
            stats
                .entry((h.spec.host.clone(), h.spec.port))
                .or_default()
                .spawned += 1;
            table.insert(h.pid, h);
        }
        Self {
            spawner,
            locks,
            table,
            pending: Vec::new(),
            shutdown,
            opts,
            stats,
        }
    }

    pub fn tracked(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.table.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self, host: &str, port: u16) -> PortStats {
        self.stats
            .get(&(host.to_string(), port))
            .copied()
            .unwrap_or_default()
    }

    /// Poll until shutdown. Returns the workers that were signalled during the drain.
    pub fn run(mut self) -> Vec<WorkerHandle> {
        event(
            "supervise",
            None,
            format!(
                "supervising workers={} policy={:?} poll_ms={}",
                self.table.len(),
                self.opts.policy,
                self.opts.poll_interval.as_millis()
            ),
        );
        loop {
            if let (Tick::ShutDown, drained) = self.tick() {
                return drained;
            }
            std::thread::sleep(self.opts.poll_interval);
        }
    }

    /// One loop iteration: dispatch a pending shutdown, reap exits, respawn.
    pub fn tick(&mut self) -> (Tick, Vec<WorkerHandle>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return (Tick::ShutDown, self.drain());
        }

        for (handle, exit) in self.reap() {
            let WorkerHandle { pid, spec } = handle;
            let target = Some((spec.host.as_str(), spec.port));
            self.stats
                .entry((spec.host.clone(), spec.port))
                .or_default()
                .exits += 1;

            let respawn = match self.opts.policy {
                RestartPolicy::Always => true,
                RestartPolicy::OnFailure => exit.is_failure(),
            };
            if !respawn {
                event("supervise", target, format!("worker exited pid={pid} {exit}; not restarting"));
                if let Err(e) = self.locks.clear(&spec.host, spec.port) {
                    event("supervise", target, format!("lock clear failed: {e}"));
                }
                continue;
            }
            event("supervise", target, format!("worker exited pid={pid} {exit}; restarting"));
            self.respawn(spec);
        }

        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, at)| *at <= now);
        self.pending = later;
        for (spec, _) in due {
            self.respawn(spec);
        }

        (Tick::Running, Vec::new())
    }

    fn respawn(&mut self, spec: WorkerSpec) {
        match self.spawner.spawn(&spec, self.locks) {
            Ok(h) => {
                self.stats
                    .entry((spec.host.clone(), spec.port))
                    .or_default()
                    .spawned += 1;
                self.table.insert(h.pid, h);
            }
            Err(e) => {
                let target = Some((spec.host.as_str(), spec.port));
                event(
                    "supervise",
                    target,
                    format!("{e}; retrying in {}ms", self.opts.restart_backoff.as_millis()),
                );
                // The lock still names the dead worker.
                let _ = self.locks.clear(&spec.host, spec.port);
                self.pending.push((spec, Instant::now() + self.opts.restart_backoff));
            }
        }
    }

    /// Non-blocking reap of every tracked pid. Exited entries are removed from the table.
    fn reap(&mut self) -> Vec<(WorkerHandle, WorkerExit)> {
        let pids: Vec<Pid> = self.table.keys().copied().collect();
        let mut out = Vec::new();
        for pid in pids {
            let exit = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, 0)) => WorkerExit::ExitedOk,
                Ok(WaitStatus::Exited(_, code)) => WorkerExit::ExitedError(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => WorkerExit::Killed(sig),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => WorkerExit::Vanished,
            };
            if let Some(h) = self.table.remove(&pid) {
                out.push((h, exit));
            }
        }
        out
    }

    /// Signal every tracked worker and clear its lock. No further respawns happen afterwards.
    fn drain(&mut self) -> Vec<WorkerHandle> {
        event(
            "supervise",
            None,
            format!("shutdown requested; stopping workers={}", self.table.len()),
        );
        self.pending.clear();
        let drained: Vec<WorkerHandle> = self.table.drain().map(|(_, h)| h).collect();
        for h in &drained {
            let target = Some((h.spec.host.as_str(), h.spec.port));
            match kill(h.pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => event("supervise", target, format!("kill pid={} failed: {e}", h.pid)),
            }
            if let Err(e) = self.locks.clear(&h.spec.host, h.spec.port) {
                event("supervise", target, format!("lock clear failed: {e}"));
            }
            event("supervise", target, format!("worker stopped pid={}", h.pid));
        }
        drained
    }
}
