//! portald: portal broker.
//!
//! Accepts host control connections, authenticates them, opens a public port
//! per host and multiplexes guest connections over the host's control link.

mod capacity;
mod config;
mod host;
mod listener;
mod server;
mod store;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::PortalServer;
use std::path::PathBuf;
use tracing::{error, info};

/// portald: portal broker
#[derive(Parser, Debug)]
#[command(name = "portald", version, about = "Reverse-tunnel broker")]
struct Cli {
    /// Control listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Control listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Redis server address
    #[arg(short, long)]
    redis: Option<String>,

    /// Prefix for Redis keys
    #[arg(long)]
    prefix: Option<String>,

    /// Maximum concurrent hosts
    #[arg(long)]
    max_hosts: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.portal/portald.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
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

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        redis: cli.redis,
        prefix: cli.prefix,
        max_hosts: cli.max_hosts,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.listen_addr(),
        "starting portald"
    );

    let server = match PortalServer::new(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "broker error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("portald stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
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
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
