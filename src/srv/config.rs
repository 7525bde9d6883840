use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Respawn on every observed exit, clean or not.
    #[default]
    Always,
    /// Respawn only on non-zero exit or death by signal.
    OnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub root_dir: PathBuf,
    pub env: String,
    pub standalone: bool,
    pub apc: bool,
    pub cache: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            env: default_env(),
            standalone: false,
            apc: false,
            cache: false,
        }
    }
}

/// Effective settings after defaults, config file and command line have been merged.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub supervise: bool,
    /// Ignored (treated as false) while supervising: the parent must stay the reaping parent.
    pub session_leader: bool,
    pub lock_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub restart_policy: RestartPolicy,
    pub restart_backoff_ms: u64,
    pub strict_privileges: bool,
    pub log_file: Option<PathBuf>,
    pub worker_log: Option<PathBuf>,
    pub listener: ListenerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: vec![default_port()],
            user: None,
            group: None,
            supervise: false,
            session_leader: true,
            lock_dir: std::env::temp_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            restart_policy: RestartPolicy::default(),
            restart_backoff_ms: default_restart_backoff_ms(),
            strict_privileges: false,
            log_file: None,
            worker_log: None,
            listener: ListenerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Whether spawned workers should call `setsid()` themselves.
    pub fn workers_detach(&self) -> bool {
        self.session_leader && !self.supervise
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1337
}

fn default_env() -> String {
    "prod".to_string()
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

// -------- YAML file schema (strict; every field optional) --------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerConfigFile {
    #[serde(default)]
    host: Option<String>,
    #[serde(default, deserialize_with = "deserialize_ports")]
    ports: Option<Vec<u16>>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    supervise: Option<bool>,
    #[serde(default)]
    session_leader: Option<bool>,
    #[serde(default)]
    lock_dir: Option<PathBuf>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    restart_backoff_ms: Option<u64>,
    #[serde(default)]
    strict_privileges: Option<bool>,
    #[serde(default)]
    log_file: Option<PathBuf>,
    #[serde(default)]
    worker_log: Option<PathBuf>,
    #[serde(default)]
    listener: Option<ListenerConfigFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListenerConfigFile {
    #[serde(default)]
    root_dir: Option<PathBuf>,
    #[serde(default)]
    env: Option<String>,
    #[serde(default)]
    standalone: Option<bool>,
    #[serde(default)]
    apc: Option<bool>,
    #[serde(default)]
    cache: Option<bool>,
}

fn deserialize_ports<'de, D>(deserializer: D) -> Result<Option<Vec<u16>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Number(n) => {
            let s = n.to_string();
            parse_ports(&s).map(Some).map_err(D::Error::custom)
        }
        serde_yaml::Value::String(s) => parse_ports(&s).map(Some).map_err(D::Error::custom),
        serde_yaml::Value::Sequence(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_yaml::Value::Number(n) => parts.push(n.to_string()),
                    serde_yaml::Value::String(s) => parts.push(s),
                    _ => return Err(D::Error::custom("ports entries must be integers")),
                }
            }
            parse_ports(&parts.join(",")).map(Some).map_err(D::Error::custom)
        }
        _ => Err(D::Error::custom(
            "ports must be an integer, a list, or a comma-separated string (e.g. \"8080,8081\")",
        )),
    }
}

/// Parse a comma-separated port list. Duplicates are dropped, keeping first occurrence.
pub fn parse_ports(s: &str) -> anyhow::Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    for part in s.split(',') {
        let t = part.trim();
        if t.is_empty() {
            continue;
        }
        let port: u16 = t
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid port {t:?}: {e}"))?;
        anyhow::ensure!(port != 0, "invalid port {t:?}: must be non-zero");
        if !out.contains(&port) {
            out.push(port);
        }
    }
    anyhow::ensure!(!out.is_empty(), "no ports provided");
    Ok(out)
}

/// Validate a listen host. The host is part of the lock file name, so path separators are refused.
pub fn parse_host(s: &str) -> anyhow::Result<String> {
    let h = s.trim();
    anyhow::ensure!(!h.is_empty(), "host must not be empty");
    anyhow::ensure!(
        !h.contains(['/', '\\', '\0']) && h != "." && h != "..",
        "invalid host {h:?}: must not contain path separators"
    );
    Ok(h.to_string())
}

/// Load settings from an optional YAML file on top of built-in defaults.
pub fn load_server_config(config_path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    let mut cfg = ServerConfig::default();
    let Some(config_path) = config_path else {
        return Ok(cfg);
    };
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: ServerConfigFile = if raw.trim().is_empty() {
        ServerConfigFile::default()
    } else {
        serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?
    };

    if let Some(h) = file_cfg.host {
        cfg.host = parse_host(&h)?;
    }
    if let Some(p) = file_cfg.ports {
        cfg.ports = p;
    }
    cfg.user = file_cfg.user.filter(|s| !s.trim().is_empty());
    cfg.group = file_cfg.group.filter(|s| !s.trim().is_empty());
    if let Some(v) = file_cfg.supervise {
        cfg.supervise = v;
    }
    if let Some(v) = file_cfg.session_leader {
        cfg.session_leader = v;
    }
    if let Some(v) = file_cfg.lock_dir {
        cfg.lock_dir = v;
    }
    if let Some(v) = file_cfg.poll_interval_ms {
        anyhow::ensure!(v > 0, "poll_interval_ms must be > 0");
        cfg.poll_interval_ms = v;
    }
    if let Some(v) = file_cfg.restart_policy {
        cfg.restart_policy = v;
    }
    if let Some(v) = file_cfg.restart_backoff_ms {
        cfg.restart_backoff_ms = v;
    }
    if let Some(v) = file_cfg.strict_privileges {
        cfg.strict_privileges = v;
    }
    cfg.log_file = file_cfg.log_file;
    cfg.worker_log = file_cfg.worker_log;
    if let Some(l) = file_cfg.listener {
        if let Some(v) = l.root_dir {
            cfg.listener.root_dir = v;
        }
        if let Some(v) = l.env {
            cfg.listener.env = v;
        }
        cfg.listener.standalone = l.standalone.unwrap_or(false);
        cfg.listener.apc = l.apc.unwrap_or(false);
        cfg.listener.cache = l.cache.unwrap_or(false);
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    if cfg.lock_dir.is_relative() {
        cfg.lock_dir = base.join(&cfg.lock_dir);
    }
    if cfg.listener.root_dir.is_relative() {
        cfg.listener.root_dir = base.join(&cfg.listener.root_dir);
    }
    if let Some(p) = cfg.log_file.take() {
        cfg.log_file = Some(if p.is_relative() { base.join(p) } else { p });
    }
    if let Some(p) = cfg.worker_log.take() {
        cfg.worker_log = Some(if p.is_relative() { base.join(p) } else { p });
    }

    Ok(cfg)
}
