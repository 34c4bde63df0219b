//! rdgate-server: remote-desktop WebSocket gateway.
//!
//! Accepts browser WebSocket connections carrying an encrypted connection
//! token, performs the handshake with the remote-desktop daemon on the
//! client's behalf, and relays protocol instructions in both directions.

mod backend;
mod config;
mod events;
mod handshake;
mod processor;
mod registry;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{GatewayConfig, Overrides};
use rdgate_core::{ConnectionDescriptor, GatewayError, GatewayResult};
use server::GatewayServer;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// rdgate-server: remote-desktop WebSocket gateway
#[derive(Parser, Debug)]
#[command(name = "rdgate-server", version, about = "Remote-desktop WebSocket gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "rdgate.toml")]
    config: String,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend daemon host
    #[arg(long)]
    backend_host: Option<String>,

    /// Backend daemon port
    #[arg(long)]
    backend_port: Option<u16>,

    /// Client inactivity limit in milliseconds (0 disables)
    #[arg(long)]
    max_inactivity_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print a token for the connection descriptor in this JSON file and exit
    #[arg(long, value_name = "JSON_FILE")]
    encrypt_token: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = Overrides {
        port: cli.port,
        backend_host: cli.backend_host.clone(),
        backend_port: cli.backend_port,
        max_inactivity_ms: cli.max_inactivity_ms,
    };
    let config = match GatewayConfig::load(Path::new(&cli.config), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Some(path) = &cli.encrypt_token {
        match encrypt_token(&config, path) {
            Ok(token) => println!("{token}"),
            Err(e) => {
                error!(error = %e, "failed to encrypt token");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        cipher = %config.token_codec.cipher(),
        "starting rdgate-server"
    );

    let listener = match transport::websocket::bind(config.listen_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let gateway = GatewayServer::from_config(&config);
    gateway.serve(listener, shutdown_signal()).await;

    info!("rdgate-server stopped");
}

/// Encrypt the descriptor stored in `path` with the configured key.
fn encrypt_token(config: &GatewayConfig, path: &Path) -> GatewayResult<String> {
    let content = std::fs::read_to_string(path)?;
    let descriptor: ConnectionDescriptor = serde_json::from_str(&content)
        .map_err(|e| GatewayError::Config(format!("invalid descriptor {}: {e}", path.display())))?;
    if !config.protocols.supports(&descriptor.connection_type) {
        return Err(GatewayError::UnsupportedProtocol(descriptor.connection_type));
    }
    config.token_codec.encrypt(&descriptor)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
