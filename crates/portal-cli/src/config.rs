//! Bridge configuration at `~/.portal/portal.toml`.
//!
//! Provides the broker, target, credential and metadata defaults plus the
//! shared `[protocol]` tuning. CLI flags always override config file values.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use portal_client::TunnelConfig;
use portal_core::ProtocolSection;
use serde::Deserialize;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
}

/// `[bridge]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// Broker control address.
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Private service to expose (empty = none).
    #[serde(default)]
    pub target: String,

    /// Session metadata sent to the broker.
    #[serde(default)]
    pub meta: String,

    /// Credential presented to the broker.
    #[serde(default)]
    pub credential: String,

    /// Seconds to wait before reconnecting; 0 exits when the session ends.
    #[serde(default)]
    pub reconnect_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            target: String::new(),
            meta: String::new(),
            credential: String::new(),
            reconnect_secs: 0,
        }
    }
}

fn default_broker() -> String {
    "127.0.0.1:9000".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub broker: Option<String>,
    pub target: Option<String>,
    pub meta: Option<String>,
    pub credential: Option<String>,
    pub reconnect_secs: Option<u64>,
}

/// Everything the bridge needs to run.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub broker: String,
    pub tunnel: TunnelConfig,
    /// Delay before reconnecting; `None` exits when the session ends.
    pub reconnect: Option<Duration>,
}

impl BridgeSettings {
    pub fn resolve(config: Config, cli: Overrides) -> Result<Self> {
        let bridge = config.bridge;
        let target = cli.target.unwrap_or(bridge.target);
        if target.is_empty() {
            anyhow::bail!("no target configured; pass --target host:port");
        }
        let broker = cli.broker.unwrap_or(bridge.broker);
        if broker.is_empty() {
            anyhow::bail!("no broker configured; pass --broker host:port");
        }

        let protocol = config
            .protocol
            .to_settings()
            .context("invalid [protocol] section")?;
        let reconnect = match cli.reconnect_secs.unwrap_or(bridge.reconnect_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            broker,
            tunnel: TunnelConfig {
                target,
                credential: cli.credential.unwrap_or(bridge.credential).into_bytes(),
                meta: cli.meta.unwrap_or(bridge.meta),
                protocol,
            },
            reconnect,
        })
    }
}
