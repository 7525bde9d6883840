//! Per-(host, port) pid files. This is the only state shared between separate invocations.
//!
//! A lock file is a hint, not a guarantee: nothing removes it except an explicit stop, so the
//! recorded worker may already be gone.

use crate::srv::error::ServerError;
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct LockStore {
    dir: PathBuf,
}

impl LockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, host: &str, port: u16) -> PathBuf {
        self.dir.join(format!("react-{host}-{port}.pid"))
    }

    /// Create or overwrite the lock for `host:port`.
    pub fn write(&self, host: &str, port: u16, pid: Pid) -> Result<(), ServerError> {
        let path = self.path_for(host, port);
        fs::write(&path, pid.as_raw().to_string()).map_err(|source| ServerError::Io { path, source })
    }

    pub fn read(&self, host: &str, port: u16) -> Result<Pid, ServerError> {
        let path = self.path_for(host, port);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ServerError::NotRunning {
                    host: host.to_string(),
                    port,
                });
            }
            Err(source) => return Err(ServerError::Io { path, source }),
        };
        match raw.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
            _ => Err(ServerError::InvalidLockFile { path, content: raw }),
        }
    }

    /// Remove the lock. Absent files are not an error.
    pub fn clear(&self, host: &str, port: u16) -> Result<(), ServerError> {
        let path = self.path_for(host, port);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ServerError::Io { path, source }),
        }
    }
}
