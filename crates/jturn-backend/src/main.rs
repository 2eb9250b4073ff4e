//! JTURN backend agent CLI
//!
//! This binary runs next to a local service and exposes it through a JTURN
//! relay server: it registers over the control channel and serves transmit
//! sockets on demand.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jturn_backend::{BackendConfig, ControlChannel};

/// JTURN backend agent - exposes a local service through a relay server
#[derive(Parser, Debug)]
#[command(name = "jturn-backend")]
#[command(about = "Expose a local service through a JTURN relay server")]
#[command(version)]
#[command(long_about = r#"
The backend agent dials the relay server, registers and keeps the session
alive. The server assigns a public proxy port; clients connecting there are
relayed to the local service named by --local-service-port.

EXAMPLES:
  # Expose a local web server through a relay
  jturn-backend --server-host relay.example.com --local-service-port 8080

  # Start using a config file
  jturn-backend --config backend-config.yaml

ENVIRONMENT VARIABLES:
  JTURN_SERVER_HOST   Relay server host
  JTURN_SERVER_PORT   Relay server registration port
  JTURN_CONFIG_FILE   Configuration file (YAML)
"#)]
struct Args {
    /// Relay server host
    #[arg(long, env = "JTURN_SERVER_HOST")]
    server_host: Option<String>,

    /// Relay server registration port
    #[arg(long, env = "JTURN_SERVER_PORT")]
    server_port: Option<u16>,

    /// Local service port to expose
    #[arg(long, env = "JTURN_LOCAL_SERVICE_PORT")]
    local_service_port: Option<u16>,

    /// Control heartbeat period in milliseconds
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Idle transmit socket keep-alive in seconds
    #[arg(long)]
    keep_alive_secs: Option<u64>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "JTURN_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    server_host: Option<String>,
    server_port: Option<u16>,
    local_service_port: Option<u16>,
    heartbeat_interval_ms: Option<u64>,
    keep_alive_secs: Option<u64>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge defaults, config file and CLI arguments; CLI takes precedence.
fn resolve_config(args: Args) -> Result<BackendConfig> {
    let file = match &args.config {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let mut config = BackendConfig::default();

    if let Some(host) = args.server_host.or(file.server_host) {
        config.server_host = host;
    }
    if let Some(port) = args.server_port.or(file.server_port) {
        config.server_port = port;
    }
    if let Some(port) = args.local_service_port.or(file.local_service_port) {
        config.local_service_port = port;
    }
    if let Some(ms) = args.heartbeat_interval_ms.or(file.heartbeat_interval_ms) {
        config.heartbeat_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = args.keep_alive_secs.or(file.keep_alive_secs) {
        config.keep_alive = Duration::from_secs(secs);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = resolve_config(args)?;
    info!("Starting JTURN backend agent");
    info!("  Relay: {}:{}", config.server_host, config.server_port);
    info!("  Local service port: {}", config.local_service_port);

    let channel = ControlChannel::start(config)
        .await
        .context("Failed to register with relay server")?;
    info!(
        "Proxied on public port {} (session {})",
        channel.proxy_port(),
        channel.session()
    );
    info!("Press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping agent..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    channel.shutdown().await;
    Ok(())
}
