//! portal: bridge CLI.
//!
//! Connects to a portal broker and exposes a private TCP service through the
//! public port the broker opens for it.

mod bridge;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing::error;

/// portal: expose a private service through a portal broker
#[derive(Parser)]
#[command(name = "portal", version, about = "Expose a private TCP service through a portal broker")]
struct Cli {
    /// Broker control address (host:port)
    #[arg(short, long)]
    broker: Option<String>,

    /// Private service to expose (host:port)
    #[arg(short, long)]
    target: Option<String>,

    /// Session metadata sent to the broker
    #[arg(short, long)]
    meta: Option<String>,

    /// Credential presented to the broker
    #[arg(short, long)]
    credential: Option<String>,

    /// Seconds to wait before reconnecting (0 = exit when the session ends)
    #[arg(short, long)]
    reconnect: Option<u64>,

    /// Config file path
    #[arg(long)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("portal=debug,portal_cli=debug,portal_client=debug,portal_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("portal=info,portal_cli=info,portal_client=info,portal_core=warn")
            .with_target(false)
            .init();
    }

    let config_path = cli.config.map(PathBuf::from).unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".portal")
            .join("portal.toml")
    });

    let overrides = config::Overrides {
        broker: cli.broker,
        target: cli.target,
        meta: cli.meta,
        credential: cli.credential,
        reconnect_secs: cli.reconnect,
    };

    let result = match config::Config::load(&config_path)
        .and_then(|cfg| config::BridgeSettings::resolve(cfg, overrides))
    {
        Ok(settings) => {
            tokio::select! {
                result = bridge::run(&settings) => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted");
                    Ok(())
                }
            }
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("portal: {e:#}");
        std::process::exit(1);
    }
}
