use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Mirror every event line into `path` (append). Only the first call per process wins.
pub fn set_log_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("failed to create log dir {}: {e}", parent.display()))?;
        }
    }
    let f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", path.display()))?;
    let _ = LOG_FILE.set(Mutex::new(f));
    Ok(())
}

pub(crate) fn format_line(component: &str, target: Option<(&str, u16)>, msg: &str) -> String {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match target {
        Some((host, port)) => format!("{ts} [{component}] port={host}:{port} {msg}"),
        None => format!("{ts} [{component}] {msg}"),
    }
}

/// Emit one operator-visible event line on stderr (and the log file, if configured).
pub fn event(component: &str, target: Option<(&str, u16)>, msg: impl AsRef<str>) {
    let line = format_line(component, target, msg.as_ref());
    eprintln!("{line}");
    if let Some(f) = LOG_FILE.get() {
        let mut g = f.lock().unwrap_or_else(|p| p.into_inner());
        let _ = writeln!(g, "{line}");
    }
}
