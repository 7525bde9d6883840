use crate::srv::config::{self, ListenerConfig, ServerConfig};
use crate::srv::error::ServerError;
use crate::srv::event;
use crate::srv::listener::ListenerOptions;
use crate::srv::server;
use crate::srv::spawner::Spawner;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "reactd", version, about = "Start, stop and supervise background listener workers")]
pub struct Args {
    /// Optional YAML file with defaults for every option
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Append every event line to this file (overrides `log_file` from the config)
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Clone, Default, ClapArgs)]
pub struct TargetArgs {
    /// User to run the server as
    #[arg(long)]
    pub user: Option<String>,
    /// Group to run the server as
    #[arg(long)]
    pub group: Option<String>,
    /// Host the server listens on (default 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,
    /// Port(s) to listen on, comma-separated (default 1337)
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,
}

#[derive(Debug, Clone, Default, ClapArgs)]
pub struct SpawnArgs {
    /// Stay in the foreground, restart workers that exit, stop them all on SIGTERM/SIGINT
    #[arg(long)]
    pub supervise: bool,
    /// Promote workers to session leaders (ignored with --supervise)
    #[arg(long = "session-leader", value_name = "BOOL")]
    pub session_leader: Option<bool>,
}

#[derive(Debug, Clone, Default, ClapArgs)]
pub struct ListenerArgs {
    /// Application root directory handed to the listener
    #[arg(long = "root-dir")]
    pub root_dir: Option<PathBuf>,
    /// Application environment name
    #[arg(long)]
    pub env: Option<String>,
    /// Standalone mode: no front web server is expected
    #[arg(long)]
    pub standalone: bool,
    /// Enable APC cache (requires --cache)
    #[arg(long)]
    pub apc: bool,
    /// Enable basic class loader cache
    #[arg(long)]
    pub cache: bool,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start one background worker per port
    Start {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        spawn: SpawnArgs,
        #[command(flatten)]
        listener: ListenerArgs,
    },
    /// Stop the workers recorded for each port
    Stop {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Stop, then start again
    Restart {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        spawn: SpawnArgs,
        #[command(flatten)]
        listener: ListenerArgs,
    },
    /// Run one listener in the foreground (also the worker entry point)
    Run {
        /// Host to listen on
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
        /// Call setsid() before serving
        #[arg(long)]
        setsid: bool,
        #[command(flatten)]
        listener: ListenerArgs,
    },
    /// Show whether a worker is recorded and alive for each port
    Status {
        #[command(flatten)]
        target: TargetArgs,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn apply_target(cfg: &mut ServerConfig, t: &TargetArgs) -> anyhow::Result<()> {
    if let Some(u) = &t.user {
        cfg.user = Some(u.clone());
    }
    if let Some(g) = &t.group {
        cfg.group = Some(g.clone());
    }
    if let Some(h) = &t.host {
        cfg.host = config::parse_host(h)?;
    }
    if let Some(p) = &t.port {
        cfg.ports = config::parse_ports(p)?;
    }
    Ok(())
}

fn apply_spawn(cfg: &mut ServerConfig, s: &SpawnArgs) {
    if s.supervise {
        cfg.supervise = true;
    }
    if let Some(v) = s.session_leader {
        cfg.session_leader = v;
    }
}

fn apply_listener(l: &mut ListenerConfig, a: &ListenerArgs) {
    if let Some(d) = &a.root_dir {
        l.root_dir = d.clone();
    }
    if let Some(e) = &a.env {
        l.env = e.clone();
    }
    l.standalone |= a.standalone;
    l.apc |= a.apc;
    l.cache |= a.cache;
}

fn report(err: &ServerError) -> i32 {
    eprintln!("{err}");
    err.exit_code()
}

fn worker_spawner(cfg: &ServerConfig) -> Result<Spawner, ServerError> {
    Ok(Spawner::current_exe()?
        .with_listener(cfg.listener.clone())
        .with_worker_log(cfg.worker_log.clone())
        .with_log_file(cfg.log_file.clone()))
}

/// Parse arguments, execute the command and return the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    let mut cfg = config::load_server_config(args.config.as_deref())?;
    if args.log_file.is_some() {
        cfg.log_file = args.log_file.clone();
    }
    if let Some(p) = cfg.log_file.clone() {
        event::set_log_file(&p)?;
    }

    match args.cmd {
        Cmd::Start { target, spawn, listener } => {
            apply_target(&mut cfg, &target)?;
            apply_spawn(&mut cfg, &spawn);
            apply_listener(&mut cfg.listener, &listener);
            let spawner = match worker_spawner(&cfg) {
                Ok(s) => s,
                Err(e) => return Ok(report(&e)),
            };
            match server::start(&cfg, &spawner) {
                Ok(st) => Ok(st.exit_code()),
                Err(e) => Ok(report(&e)),
            }
        }
        Cmd::Stop { target } => {
            apply_target(&mut cfg, &target)?;
            match server::stop(&cfg) {
                Ok((_, st)) => Ok(st.exit_code()),
                Err(e) => Ok(report(&e)),
            }
        }
        Cmd::Restart { target, spawn, listener } => {
            apply_target(&mut cfg, &target)?;
            apply_spawn(&mut cfg, &spawn);
            apply_listener(&mut cfg.listener, &listener);
            let spawner = match worker_spawner(&cfg) {
                Ok(s) => s,
                Err(e) => return Ok(report(&e)),
            };
            match server::restart(&cfg, &spawner) {
                Ok(code) => Ok(code),
                Err(e) => Ok(report(&e)),
            }
        }
        Cmd::Run { host, port, setsid, listener } => {
            apply_listener(&mut cfg.listener, &listener);
            let opts = ListenerOptions {
                root_dir: cfg.listener.root_dir.clone(),
                host: match host {
                    Some(h) => config::parse_host(&h)?,
                    None => cfg.host.clone(),
                },
                port: port.unwrap_or_else(|| cfg.ports.first().copied().unwrap_or(1337)),
                env: cfg.listener.env.clone(),
                standalone: cfg.listener.standalone,
                apc: cfg.listener.apc,
                cache: cfg.listener.cache,
            };
            server::run_foreground(opts, setsid)?;
            Ok(0)
        }
        Cmd::Status { target, format } => {
            apply_target(&mut cfg, &target)?;
            let entries = server::status(&cfg);
            match format {
                OutputFormat::Text => print!("{}", server::render_status_text(&entries)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            }
            let all_running = entries
                .iter()
                .all(|e| e.state == server::PortState::Running);
            Ok(if all_running { 0 } else { 1 })
        }
    }
}
