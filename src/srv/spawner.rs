use crate::srv::config::ListenerConfig;
use crate::srv::error::{CommandStatus, ServerError};
use crate::srv::event::event;
use crate::srv::lockfile::LockStore;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Listener configuration for one worker. Immutable once spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub host: String,
    pub port: u16,
    pub session_detached: bool,
}

impl WorkerSpec {
    pub fn new(host: impl Into<String>, port: u16, session_detached: bool) -> Self {
        Self {
            host: host.into(),
            port,
            session_detached,
        }
    }
}

/// A worker the current invocation started. Lives only in this process' memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub pid: Pid,
    pub spec: WorkerSpec,
}

/// Launches workers as fresh processes running `<program> <base_args..> --host H --port P ...`.
///
/// The default program is this binary in `run` mode, so every worker starts from a clean
/// address space instead of inheriting the parent's state.
#[derive(Debug, Clone)]
pub struct Spawner {
    program: PathBuf,
    base_args: Vec<OsString>,
    listener: ListenerConfig,
    worker_log: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

impl Spawner {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            base_args,
            listener: ListenerConfig::default(),
            worker_log: None,
            log_file: None,
        }
    }

    /// Re-execute the running binary with the `run` subcommand.
    pub fn current_exe() -> Result<Self, ServerError> {
        let exe = std::env::current_exe().map_err(|e| {
            ServerError::CapabilityMissing(format!("cannot locate own executable to launch workers: {e}"))
        })?;
        Ok(Self::new(exe, vec![OsString::from("run")]))
    }

    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_worker_log(mut self, path: Option<PathBuf>) -> Self {
        self.worker_log = path;
        self
    }

    /// Event log file the workers mirror their own event lines into.
    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    pub fn worker_args(&self, spec: &WorkerSpec) -> Vec<OsString> {
        let mut args = self.base_args.clone();
        if let Some(path) = &self.log_file {
            args.push("--log-file".into());
            args.push(path.clone().into_os_string());
        }
        args.push("--host".into());
        args.push(spec.host.clone().into());
        args.push("--port".into());
        args.push(spec.port.to_string().into());
        if spec.session_detached {
            args.push("--setsid".into());
        }
        args.push("--root-dir".into());
        args.push(self.listener.root_dir.clone().into_os_string());
        args.push("--env".into());
        args.push(self.listener.env.clone().into());
        if self.listener.standalone {
            args.push("--standalone".into());
        }
        if self.listener.apc {
            args.push("--apc".into());
        }
        if self.listener.cache {
            args.push("--cache".into());
        }
        args
    }

    fn command_for(&self, spec: &WorkerSpec) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.worker_args(spec));
        cmd.stdin(Stdio::null());
        if let Some(path) = &self.worker_log {
            let f = open_append(path)?;
            cmd.stdout(f.try_clone()?);
            cmd.stderr(f);
        }
        Ok(cmd)
    }

    /// Start one worker and record its lock.
    ///
    /// If the lock cannot be written the new worker is sent SIGTERM and the spawn counts as
    /// failed, so no worker ever runs without a lock pointing at it.
    pub fn spawn(&self, spec: &WorkerSpec, locks: &LockStore) -> Result<WorkerHandle, ServerError> {
        let target = Some((spec.host.as_str(), spec.port));
        let spawn_failed = |reason: String| ServerError::SpawnFailed {
            host: spec.host.clone(),
            port: spec.port,
            reason,
        };

        let mut cmd = self
            .command_for(spec)
            .map_err(|e| spawn_failed(format!("prepare command: {e}")))?;
        let child = cmd.spawn().map_err(|e| {
            spawn_failed(format!(
                "spawn program={} failed: kind={:?} os_error={:?} err={e}",
                self.program.display(),
                e.kind(),
                e.raw_os_error()
            ))
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        // Reaping is done by pid (supervisor) or left to init once this invocation exits.
        drop(child);

        if let Err(e) = locks.write(&spec.host, spec.port, pid) {
            let _ = kill(pid, Signal::SIGTERM);
            event("spawn", target, format!("lock write failed, terminated pid={pid}: {e}"));
            return Err(spawn_failed(format!("lock write failed: {e}")));
        }

        event(
            "spawn",
            target,
            format!("worker started pid={pid} detached={}", spec.session_detached),
        );
        Ok(WorkerHandle {
            pid,
            spec: spec.clone(),
        })
    }
}

/// Spawn every spec in order. A failed port is recorded and does not stop the remaining ones.
pub fn spawn_all(spawner: &Spawner, locks: &LockStore, specs: &[WorkerSpec]) -> (Vec<WorkerHandle>, CommandStatus) {
    let mut handles = Vec::with_capacity(specs.len());
    let mut status = CommandStatus::default();
    for spec in specs {
        match spawner.spawn(spec, locks) {
            Ok(h) => handles.push(h),
            Err(e) => {
                event("spawn", Some((spec.host.as_str(), spec.port)), format!("{e}"));
                status.record(e);
            }
        }
    }
    (handles, status)
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;

    fn sleeper() -> Spawner {
        Spawner::new("/bin/sh", vec!["-c".into(), "exec sleep 30".into()])
    }

    fn kill_and_reap(pid: Pid) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }

    #[test]
    fn worker_args_carry_spec_and_listener_flags() {
        let spawner = Spawner::new("/usr/bin/reactd", vec!["run".into()]).with_listener(ListenerConfig {
            root_dir: PathBuf::from("/srv/app"),
            env: "dev".into(),
            standalone: true,
            apc: false,
            cache: true,
        });
        let args = spawner.worker_args(&WorkerSpec::new("127.0.0.1", 8080, true));
        let args: Vec<String> = args.into_iter().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(
            args,
            vec![
                "run", "--host", "127.0.0.1", "--port", "8080", "--setsid", "--root-dir", "/srv/app", "--env",
                "dev", "--standalone", "--cache",
            ]
        );
    }

    #[test]
    fn attached_worker_has_no_setsid_flag() {
        let spawner = Spawner::new("reactd", vec!["run".into()]);
        let args = spawner.worker_args(&WorkerSpec::new("h", 1, false));
        assert!(!args.iter().any(|a| a == "--setsid"));
    }

    #[test]
    fn log_file_is_handed_to_workers() {
        let spawner = Spawner::new("reactd", vec!["run".into()]).with_log_file(Some("/var/log/reactd.log".into()));
        let args = spawner.worker_args(&WorkerSpec::new("h", 1, false));
        let pos = args.iter().position(|a| a == "--log-file").unwrap();
        assert_eq!(args[pos + 1], "/var/log/reactd.log");

        let args = sleeper().worker_args(&WorkerSpec::new("h", 1, false));
        assert!(!args.iter().any(|a| a == "--log-file"));
    }

    #[test]
    fn spawn_writes_lock_with_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockStore::new(dir.path());
        let spec = WorkerSpec::new("127.0.0.1", 18080, false);

        let h = sleeper().spawn(&spec, &locks).unwrap();
        assert_eq!(h.spec, spec);
        assert_eq!(locks.read("127.0.0.1", 18080).unwrap(), h.pid);
        assert!(kill(h.pid, None).is_ok());

        kill_and_reap(h.pid);
    }

    #[test]
    fn missing_program_is_spawn_failed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockStore::new(dir.path());
        let spawner = Spawner::new("/nonexistent/reactd-worker", vec![]);
        let err = spawner
            .spawn(&WorkerSpec::new("127.0.0.1", 18081, false), &locks)
            .unwrap_err();
        assert_eq!(err.exit_code(), 10);
        assert!(!locks.path_for("127.0.0.1", 18081).exists());
    }

    #[test]
    fn unwritable_lock_dir_fails_the_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockStore::new(dir.path().join("missing"));
        let err = sleeper()
            .spawn(&WorkerSpec::new("127.0.0.1", 18082, false), &locks)
            .unwrap_err();
        assert!(matches!(err, ServerError::SpawnFailed { port: 18082, .. }));
    }

    #[test]
    fn spawn_all_continues_after_failures() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockStore::new(dir.path());
        let spawner = Spawner::new("/nonexistent/reactd-worker", vec![]);
        let specs = vec![
            WorkerSpec::new("127.0.0.1", 18083, false),
            WorkerSpec::new("127.0.0.1", 18084, false),
        ];
        let (handles, status) = spawn_all(&spawner, &locks, &specs);
        assert!(handles.is_empty());
        assert_eq!(status.failures.len(), 2);
        assert_eq!(status.exit_code(), 10);
    }

    #[test]
    fn spawn_all_starts_one_worker_per_port() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockStore::new(dir.path());
        let specs = vec![
            WorkerSpec::new("127.0.0.1", 18085, false),
            WorkerSpec::new("127.0.0.1", 18086, false),
        ];
        let (handles, status) = spawn_all(&sleeper(), &locks, &specs);
        assert!(status.is_success());
        assert_eq!(handles.len(), 2);
        assert_ne!(handles[0].pid, handles[1].pid);
        assert!(locks.path_for("127.0.0.1", 18085).exists());
        assert!(locks.path_for("127.0.0.1", 18086).exists());
        for h in handles {
            kill_and_reap(h.pid);
        }
    }

    #[test]
    fn worker_log_receives_output() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockStore::new(dir.path());
        let log = dir.path().join("logs").join("worker.log");
        let spawner = Spawner::new("/bin/sh", vec!["-c".into(), "echo hello-from-worker".into()])
            .with_worker_log(Some(log.clone()));
        let h = spawner
            .spawn(&WorkerSpec::new("127.0.0.1", 18087, false), &locks)
            .unwrap();
        let _ = waitpid(h.pid, None);
        let out = std::fs::read_to_string(&log).unwrap();
        assert!(out.contains("hello-from-worker"), "{out}");
    }
}
