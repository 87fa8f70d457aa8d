//! HTTP server command implementation.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tfmux::build_info;
use tfmux::config::{Config, parse_client_option};
use tfmux::process::ProcessRegistry;
use tfmux::server::{self, AppState};
use tfmux::shutdown::ShutdownOrchestrator;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "tfmux.yaml")]
    config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to (overrides config file)
    #[arg(short, long)]
    interface: Option<IpAddr>,

    /// Listen on a unix domain socket instead of TCP
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Signal sent to processes on stop, by name or number
    #[arg(short, long)]
    signal: Option<String>,

    /// Seconds viewers wait before reconnecting
    #[arg(short, long)]
    reconnect: Option<u64>,

    /// Do not allow viewers to write to the terminals
    #[arg(short = 'R', long)]
    readonly: bool,

    /// Reject connections from a different origin
    #[arg(short = 'O', long)]
    check_origin: bool,

    /// Maximum concurrent viewers, 0 for unlimited
    #[arg(short, long)]
    max_clients: Option<u32>,

    /// Accept only one viewer and exit when it disconnects
    #[arg(short, long)]
    once: bool,

    /// Custom index.html to serve
    #[arg(short = 'I', long)]
    index: Option<PathBuf>,

    /// Client option forwarded to the frontend, repeatable
    #[arg(short = 't', long = "client-option", value_name = "KEY=VALUE")]
    client_options: Vec<String>,

    /// TERM for spawned processes
    #[arg(short = 'T', long)]
    terminal_type: Option<String>,

    /// Basic auth credential
    #[arg(short = 'C', long, value_name = "USER:PASS")]
    credential: Option<String>,

    /// Output bytes retained per process
    #[arg(long)]
    buffer_capacity: Option<usize>,

    /// Command to start as a session
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl ServeArgs {
    /// CLI overrides config.
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(interface) = self.interface {
            config.server.host = interface.to_string();
        }
        if let Some(socket) = self.socket {
            config.server.unix_socket = Some(socket);
        }
        if let Some(signal) = self.signal {
            config.terminal.termination_signal = signal;
        }
        if let Some(reconnect) = self.reconnect {
            config.terminal.reconnect_seconds = reconnect;
        }
        config.terminal.read_only |= self.readonly;
        config.terminal.check_origin |= self.check_origin;
        config.terminal.once |= self.once;
        if let Some(max_clients) = self.max_clients {
            config.terminal.max_clients = max_clients;
        }
        if let Some(index) = self.index {
            config.terminal.index = Some(index);
        }
        for option in &self.client_options {
            let (key, value) = parse_client_option(option)?;
            config.terminal.client_options.insert(key, value);
        }
        if let Some(terminal_type) = self.terminal_type {
            config.terminal.terminal_type = terminal_type;
        }
        if let Some(credential) = self.credential {
            config.terminal.credential = Some(credential);
        }
        if let Some(capacity) = self.buffer_capacity {
            config.process.buffer_capacity = capacity;
        }
        if !self.command.is_empty() {
            config.process.sessions.push(self.command);
        }
        Ok(())
    }
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let config_path = args.config.clone();
    let mut config = Config::load(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path))?;
    args.apply(&mut config)?;
    config.validate()?;

    info!(version = %build_info::CURRENT, "Starting tfmux");

    let registry = ProcessRegistry::new(config.registry_config()?)?;
    let orchestrator = ShutdownOrchestrator::new(registry.clone());
    tokio::spawn(orchestrator.clone().listen());

    for argv in &config.process.sessions {
        let id = registry
            .create_process(argv.clone())
            .with_context(|| format!("failed to start '{}'", argv.join(" ")))?;
        info!(id = %id, command = %argv.join(" "), "Session started");
    }
    if registry.is_empty() {
        warn!("No sessions configured; create them through the API");
    }

    let app = server::build_app(
        AppState::new(orchestrator.clone()),
        config.server.request_timeout_seconds,
    );
    let token = orchestrator.event_loop_token();

    let served = match &config.server.unix_socket {
        Some(path) => serve_unix(app, path, token).await,
        None => serve_tcp(app, &config, token).await,
    };

    // The server may also stop on its own, e.g. after an accept error.
    orchestrator.shutdown_all();
    registry
        .drain(Duration::from_secs(config.process.drain_timeout_seconds))
        .await;

    served?;
    info!("Server stopped");
    Ok(())
}

async fn serve_tcp(app: Router, config: &Config, token: CancellationToken) -> Result<()> {
    let ip: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid host '{}'", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(addr = %addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

async fn serve_unix(app: Router, path: &Path, token: CancellationToken) -> Result<()> {
    // A previous run may have left its socket behind.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;

    info!(socket = %path.display(), "Listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;

    if let Err(e) = std::fs::remove_file(path) {
        warn!(socket = %path.display(), error = %e, "Failed to remove socket");
    }
    result?;
    Ok(())
}
