use std::path::PathBuf;

/// Failures surfaced by the start/stop/restart flows.
///
/// Fatal variants (`CapabilityMissing`, `UnknownIdentity`) are detected before any worker is
/// spawned. Per-port variants are collected into a [`CommandStatus`] instead of aborting.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("required capability is missing: {0}")]
    CapabilityMissing(String),

    #[error("{kind} {name} cannot be found on this system")]
    UnknownIdentity { kind: IdentityKind, name: String },

    #[error("could not set {kind} {name}: {reason}")]
    IdentitySwitchFailed {
        kind: IdentityKind,
        name: String,
        reason: String,
    },

    #[error("worker for {host}:{port} could not be started: {reason}")]
    SpawnFailed { host: String, port: u16, reason: String },

    #[error("server on {host}:{port} is not running")]
    NotRunning { host: String, port: u16 },

    #[error("lock file {} does not contain a pid: {content:?}", path.display())]
    InvalidLockFile { path: PathBuf, content: String },

    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::CapabilityMissing(_) => 1,
            ServerError::NotRunning { .. } => 1,
            ServerError::InvalidLockFile { .. } => 1,
            ServerError::Io { .. } => 1,
            ServerError::UnknownIdentity { .. } => 2,
            ServerError::IdentitySwitchFailed { .. } => 2,
            ServerError::SpawnFailed { .. } => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    User,
    Group,
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IdentityKind::User => "user",
            IdentityKind::Group => "group",
        })
    }
}

/// Aggregated result of a multi-port command.
#[derive(Debug, Default)]
pub struct CommandStatus {
    pub failures: Vec<ServerError>,
}

impl CommandStatus {
    pub fn record(&mut self, err: ServerError) {
        self.failures.push(err);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Highest exit code among recorded failures, 0 if there are none.
    pub fn exit_code(&self) -> i32 {
        self.failures
            .iter()
            .map(ServerError::exit_code)
            .max()
            .unwrap_or(0)
    }
}
