//! Broker configuration: TOML file + CLI overrides.

use std::path::{Path, PathBuf};

use portal_core::{PortalError, PortalResult, ProtocolSection, ProtocolSettings};
use serde::Deserialize;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface the per-host guest ports are opened on.
    #[serde(default = "default_bind")]
    pub guest_bind: String,
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,
    /// Shared secret hosts must present; unset accepts any credential.
    #[serde(default)]
    pub credential: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            guest_bind: default_bind(),
            max_hosts: default_max_hosts(),
            credential: None,
        }
    }
}

/// `[store]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            address: None,
            prefix: default_prefix(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_max_hosts() -> usize {
    100
}
fn default_prefix() -> String {
    "netherhub".to_string()
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub redis: Option<String>,
    pub prefix: Option<String>,
    pub max_hosts: Option<usize>,
}

/// Resolved broker configuration (CLI overrides applied, protocol validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub guest_bind: String,
    pub max_hosts: usize,
    pub credential: Option<String>,
    pub store_address: Option<String>,
    pub store_prefix: String,
    pub protocol: ProtocolSettings,
}

impl ServerConfig {
    /// Load config from TOML file (if present), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> PortalResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> PortalResult<Self> {
        let max_hosts = cli.max_hosts.unwrap_or(file.server.max_hosts);
        if max_hosts == 0 {
            return Err(PortalError::Config("max_hosts must be at least 1".into()));
        }

        Ok(Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            guest_bind: file.server.guest_bind,
            max_hosts,
            credential: file.server.credential.filter(|c| !c.is_empty()),
            store_address: cli.redis.or(file.store.address),
            store_prefix: cli.prefix.unwrap_or(file.store.prefix),
            protocol: file.protocol.to_settings()?,
        })
    }

    /// `bind:port` for the control listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse(content: &str) -> PortalResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| PortalError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let config = ServerConfig::load(None, CliOverrides::default()).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.guest_bind, "0.0.0.0");
        assert_eq!(config.max_hosts, 100);
        assert_eq!(config.credential, None);
        assert_eq!(config.store_address, None);
        assert_eq!(config.store_prefix, "netherhub");
        assert_eq!(config.protocol, ProtocolSettings::default());
    }

    #[test]
    fn parses_full_file() {
        let file = parse(
            r#"
            [server]
            bind = "127.0.0.1"
            port = 9100
            guest_bind = "127.0.0.1"
            max_hosts = 4
            credential = "hunter2"

            [store]
            address = "redis://cache:6379"
            prefix = "tunnels"

            [protocol]
            keepalive_secs = 0
            read_timeout_secs = 45
            "#,
        )
        .unwrap();
        let config = ServerConfig::resolve(file, CliOverrides::default()).unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9100");
        assert_eq!(config.max_hosts, 4);
        assert_eq!(config.credential.as_deref(), Some("hunter2"));
        assert_eq!(config.store_address.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store_prefix, "tunnels");
        assert_eq!(config.protocol.keepalive_interval, None);
        assert_eq!(config.protocol.read_timeout, Duration::from_secs(45));
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse("[server]\nport = 9100\n[store]\nprefix = \"a\"\n").unwrap();
        let cli = CliOverrides {
            bind: Some("127.0.0.1".into()),
            port: Some(7000),
            redis: Some("redis://localhost:6379".into()),
            prefix: Some("b".into()),
            max_hosts: Some(2),
        };
        let config = ServerConfig::resolve(file, cli).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:7000");
        assert_eq!(config.store_address.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.store_prefix, "b");
        assert_eq!(config.max_hosts, 2);
    }

    #[test]
    fn empty_credential_means_none() {
        let file = parse("[server]\ncredential = \"\"\n").unwrap();
        let config = ServerConfig::resolve(file, CliOverrides::default()).unwrap();
        assert_eq!(config.credential, None);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse("[server]\nport = \"nine\"\n").is_err());

        let file = parse("[protocol]\nqueue_depth = 0\n").unwrap();
        assert!(ServerConfig::resolve(file, CliOverrides::default()).is_err());

        let cli = CliOverrides {
            max_hosts: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), cli).is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = Path::new("/nonexistent/portal/portald.toml");
        let config = ServerConfig::load(Some(path), CliOverrides::default()).unwrap();
        assert_eq!(config.port, 9000);
    }
}
