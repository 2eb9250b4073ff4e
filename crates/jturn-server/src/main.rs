//! JTURN relay server CLI
//!
//! This binary runs the public relay: it accepts backend registrations,
//! allocates a public proxy port per backend and relays client connections
//! through the backends' transmit sockets.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jturn_server::{ServerConfig, TurnServer};

/// JTURN relay server - exposes NAT-hidden backends on public proxy ports
#[derive(Parser, Debug)]
#[command(name = "jturn-server")]
#[command(about = "Run the JTURN relay server")]
#[command(version)]
#[command(long_about = r#"
The JTURN server listens on a single registration port. Backends dial in,
get a public proxy port assigned, and every client connecting to that port
is relayed through the backend to its local service.

EXAMPLES:
  # Start with defaults (registration on 13520)
  jturn-server

  # Custom registration port and proxy range
  jturn-server --registration-port 4000 --min-proxy-port 50000 --max-proxy-port 51000

  # Start using a config file
  jturn-server --config server-config.yaml

ENVIRONMENT VARIABLES:
  JTURN_REGISTRATION_PORT  Registration port
  JTURN_CONFIG_FILE        Configuration file (YAML)
"#)]
struct Args {
    /// Registration port for backend control and transmit sockets
    #[arg(long, env = "JTURN_REGISTRATION_PORT")]
    registration_port: Option<u16>,

    /// Maximum number of simultaneously registered backends
    #[arg(long)]
    max_backends: Option<usize>,

    /// Maximum concurrently relayed clients per backend
    #[arg(long)]
    max_clients_per_backend: Option<usize>,

    /// Lower bound of the proxy-port allocation range
    #[arg(long)]
    min_proxy_port: Option<u16>,

    /// Upper bound of the proxy-port allocation range
    #[arg(long)]
    max_proxy_port: Option<u16>,

    /// Backend heartbeat timeout in milliseconds
    #[arg(long)]
    online_timeout_ms: Option<u64>,

    /// Idle transmit socket keep-alive in seconds
    #[arg(long)]
    transmit_keep_alive_secs: Option<u64>,

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
    registration_port: Option<u16>,
    max_backends: Option<usize>,
    max_clients_per_backend: Option<usize>,
    min_proxy_port: Option<u16>,
    max_proxy_port: Option<u16>,
    online_timeout_ms: Option<u64>,
    transmit_keep_alive_secs: Option<u64>,
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
fn resolve_config(args: &Args) -> Result<ServerConfig> {
    let file = match &args.config {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let mut config = ServerConfig::default();

    if let Some(port) = args.registration_port.or(file.registration_port) {
        config.registration_port = port;
    }
    if let Some(max) = args.max_backends.or(file.max_backends) {
        config.max_backends = max;
    }
    if let Some(max) = args
        .max_clients_per_backend
        .or(file.max_clients_per_backend)
    {
        config.max_clients_per_backend = max;
    }
    if let Some(port) = args.min_proxy_port.or(file.min_proxy_port) {
        config.min_proxy_port = port;
    }
    if let Some(port) = args.max_proxy_port.or(file.max_proxy_port) {
        config.max_proxy_port = port;
    }
    if let Some(ms) = args.online_timeout_ms.or(file.online_timeout_ms) {
        config.online_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = args
        .transmit_keep_alive_secs
        .or(file.transmit_keep_alive_secs)
    {
        config.transmit_keep_alive = Duration::from_secs(secs);
    }

    anyhow::ensure!(
        config.min_proxy_port <= config.max_proxy_port,
        "min proxy port {} exceeds max proxy port {}",
        config.min_proxy_port,
        config.max_proxy_port
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = resolve_config(&args)?;
    info!("Starting JTURN server");
    info!("  Registration port: {}", config.registration_port);
    info!(
        "  Proxy port range: {}-{}",
        config.min_proxy_port, config.max_proxy_port
    );
    info!("  Max backends: {}", config.max_backends);
    info!(
        "  Max clients per backend: {}",
        config.max_clients_per_backend
    );

    let server = TurnServer::new(config);
    server.start().await.context("Failed to start server")?;
    info!("Press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_overrides_defaults() {
        let file: ConfigFile = serde_yaml::from_str(
            "registration_port: 4000\nmax_backends: 8\nonline_timeout_ms: 1500\n",
        )
        .unwrap();
        assert_eq!(file.registration_port, Some(4000));
        assert_eq!(file.max_backends, Some(8));
        assert_eq!(file.online_timeout_ms, Some(1500));
        assert!(file.min_proxy_port.is_none());
    }

    #[test]
    fn test_resolve_rejects_inverted_port_range() {
        let args = Args::parse_from([
            "jturn-server",
            "--min-proxy-port",
            "60000",
            "--max-proxy-port",
            "50000",
        ]);
        assert!(resolve_config(&args).is_err());
    }
}
