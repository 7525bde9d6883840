use crate::srv::config::ServerConfig;
use crate::srv::error::{CommandStatus, ServerError};
use crate::srv::event::event;
use crate::srv::listener::{self, ListenerOptions};
use crate::srv::lockfile::LockStore;
use crate::srv::privilege;
use crate::srv::spawner::{spawn_all, Spawner, WorkerSpec};
use crate::srv::stopper::{self, pid_alive};
use crate::srv::supervisor::{install_shutdown_handlers, Supervisor, SupervisorOptions};
use anyhow::Context as _;
use nix::unistd::{setsid, Pid};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

/// How long `restart` waits for stopped workers to release their ports.
const RESTART_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn worker_specs(cfg: &ServerConfig) -> Vec<WorkerSpec> {
    cfg.ports
        .iter()
        .map(|&port| WorkerSpec::new(cfg.host.clone(), port, cfg.workers_detach()))
        .collect()
}

/// Spawn one worker per configured port. With supervision enabled this blocks until a
/// termination signal has been handled.
pub fn start(cfg: &ServerConfig, spawner: &Spawner) -> Result<CommandStatus, ServerError> {
    let locks = LockStore::new(&cfg.lock_dir);

    // Everything fatal happens before the first spawn.
    let shutdown = Arc::new(AtomicBool::new(false));
    if cfg.supervise {
        install_shutdown_handlers(&shutdown)?;
    }
    privilege::drop_privileges(cfg.user.as_deref(), cfg.group.as_deref(), cfg.strict_privileges)?;

    let specs = worker_specs(cfg);
    let (handles, status) = spawn_all(spawner, &locks, &specs);
    for h in &handles {
        println!("Server running on {}:{}.", h.spec.host, h.spec.port);
    }

    if !cfg.supervise || handles.is_empty() {
        return Ok(status);
    }

    let sup = Supervisor::new(
        spawner,
        &locks,
        handles,
        shutdown,
        SupervisorOptions {
            policy: cfg.restart_policy,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            restart_backoff: Duration::from_millis(cfg.restart_backoff_ms),
        },
    );
    let drained = sup.run();
    event("supervise", None, format!("shutdown complete; stopped workers={}", drained.len()));
    Ok(CommandStatus::default())
}

/// Signal the workers recorded for every configured port.
pub fn stop(cfg: &ServerConfig) -> Result<(Vec<Pid>, CommandStatus), ServerError> {
    privilege::drop_privileges(cfg.user.as_deref(), cfg.group.as_deref(), cfg.strict_privileges)?;
    let locks = LockStore::new(&cfg.lock_dir);
    Ok(stopper::stop_ports(&locks, &cfg.host, &cfg.ports))
}

/// Stop then start. The exit code is the larger of the two phases' codes.
pub fn restart(cfg: &ServerConfig, spawner: &Spawner) -> Result<i32, ServerError> {
    let (signalled, stop_status) = stop(cfg)?;
    let still_alive = stopper::wait_gone(&signalled, RESTART_DRAIN_TIMEOUT);
    for pid in still_alive {
        event("restart", None, format!("pid={pid} still running after SIGTERM; starting anyway"));
    }
    // Identity was already switched by stop; repeating it is harmless and keeps start self-contained.
    let start_status = start(cfg, spawner)?;
    Ok(stop_status.exit_code().max(start_status.exit_code()))
}

/// Host one listener in the current process until it stops or SIGTERM arrives.
pub fn run_foreground(opts: ListenerOptions, detach: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(async move {
        let host = opts.host.clone();
        let target = Some((host.as_str(), opts.port));

        let mut term = unix_signal(SignalKind::terminate())
            .map_err(|e| ServerError::CapabilityMissing(format!("cannot install SIGTERM handler: {e}")))?;

        if detach {
            if let Err(e) = setsid() {
                event("worker", target, format!("unable to become session leader: {e}"));
            }
        }

        println!("Server running on {}:{}.", opts.host, opts.port);
        let listener = listener::configure(opts.clone()).build().await?;
        tokio::select! {
            r = listener.run() => r?,
            _ = term.recv() => {
                event("worker", target, "SIGTERM received; exiting");
                std::process::exit(0);
            }
        }
        println!("Server stopped.");
        Ok::<(), anyhow::Error>(())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Running,
    Stale,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub host: String,
    pub port: u16,
    pub state: PortState,
    pub pid: Option<i32>,
}

/// Read-only view of the lock store for the configured ports.
pub fn status(cfg: &ServerConfig) -> Vec<PortStatus> {
    let locks = LockStore::new(&cfg.lock_dir);
    cfg.ports
        .iter()
        .map(|&port| {
            let (state, pid) = match locks.read(&cfg.host, port) {
                Ok(pid) if pid_alive(pid) => (PortState::Running, Some(pid.as_raw())),
                Ok(pid) => (PortState::Stale, Some(pid.as_raw())),
                Err(_) => (PortState::Stopped, None),
            };
            PortStatus {
                host: cfg.host.clone(),
                port,
                state,
                pid,
            }
        })
        .collect()
}

pub fn render_status_text(entries: &[PortStatus]) -> String {
    let mut out = String::new();
    for e in entries {
        let state = match e.state {
            PortState::Running => "running",
            PortState::Stale => "stale",
            PortState::Stopped => "stopped",
        };
        match e.pid {
            Some(pid) => out.push_str(&format!("{}:{} {state} pid={pid}\n", e.host, e.port)),
            None => out.push_str(&format!("{}:{} {state}\n", e.host, e.port)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::waitpid;

    fn cfg_in(dir: &std::path::Path, ports: Vec<u16>) -> ServerConfig {
        ServerConfig {
            ports,
            lock_dir: dir.to_path_buf(),
            ..ServerConfig::default()
        }
    }

    fn sleeper() -> Spawner {
        Spawner::new("/bin/sh", vec!["-c".into(), "exec sleep 30".into()])
    }

    #[test]
    fn start_writes_one_lock_per_port_then_stop_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path(), vec![19201, 19202]);
        let locks = LockStore::new(dir.path());

        let st = start(&cfg, &sleeper()).unwrap();
        assert!(st.is_success());
        let a = locks.read("127.0.0.1", 19201).unwrap();
        let b = locks.read("127.0.0.1", 19202).unwrap();
        assert_ne!(a, b);
        assert!(pid_alive(a) && pid_alive(b));

        let (signalled, st) = stop(&cfg).unwrap();
        assert!(st.is_success());
        assert_eq!(signalled.len(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        for pid in signalled {
            let _ = waitpid(pid, None);
        }
    }

    #[test]
    fn unknown_user_aborts_before_any_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            user: Some("no-such-user-reactd-test".into()),
            ..cfg_in(dir.path(), vec![19203])
        };
        let err = start(&cfg, &sleeper()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn restart_replaces_the_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path(), vec![19204]);
        let locks = LockStore::new(dir.path());

        start(&cfg, &sleeper()).unwrap();
        let before = locks.read("127.0.0.1", 19204).unwrap();

        // The old worker is our child here, so reap it in the background for wait_gone to see it exit.
        let reaper = std::thread::spawn(move || {
            let _ = waitpid(before, None);
        });
        assert_eq!(restart(&cfg, &sleeper()).unwrap(), 0);
        reaper.join().unwrap();

        let after = locks.read("127.0.0.1", 19204).unwrap();
        assert_ne!(before, after);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        kill(after, Signal::SIGKILL).unwrap();
        let _ = waitpid(after, None);
    }

    #[test]
    fn restart_of_stopped_port_still_starts_and_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path(), vec![19205]);
        let locks = LockStore::new(dir.path());

        assert_eq!(restart(&cfg, &sleeper()).unwrap(), 1);
        let pid = locks.read("127.0.0.1", 19205).unwrap();
        kill(pid, Signal::SIGKILL).unwrap();
        let _ = waitpid(pid, None);
    }

    #[test]
    fn status_distinguishes_running_stale_and_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path(), vec![19206, 19207, 19208]);
        let locks = LockStore::new(dir.path());

        let live = sleeper().spawn(&WorkerSpec::new("127.0.0.1", 19206, false), &locks).unwrap();
        let dead = Spawner::new("/bin/sh", vec!["-c".into(), "exit 0".into()])
            .spawn(&WorkerSpec::new("127.0.0.1", 19207, false), &locks)
            .unwrap();
        let _ = waitpid(dead.pid, None);

        let st = status(&cfg);
        assert_eq!(st[0].state, PortState::Running);
        assert_eq!(st[0].pid, Some(live.pid.as_raw()));
        assert_eq!(st[1].state, PortState::Stale);
        assert_eq!(st[2].state, PortState::Stopped);
        assert_eq!(st[2].pid, None);

        let text = render_status_text(&st);
        assert!(text.contains("127.0.0.1:19208 stopped\n"), "{text}");
        let json = serde_json::to_string(&st).unwrap();
        assert!(json.contains("\"state\":\"stale\""), "{json}");

        kill(live.pid, Signal::SIGKILL).unwrap();
        let _ = waitpid(live.pid, None);
    }
}
