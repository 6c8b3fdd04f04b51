//! Protocol tuning shared by broker and bridge.
//!
//! [`ProtocolSection`] is the `[protocol]` table of both config files;
//! [`ProtocolSettings`] is the validated runtime form handed to the engine.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_PAYLOAD;
use crate::error::{PortalError, PortalResult};

/// Runtime protocol settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Deadline for decoding one control frame.
    pub read_timeout: Duration,
    /// Deadline for writing one control frame or one guest chunk.
    pub write_timeout: Duration,
    /// Ping period; `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Largest payload accepted from the wire.
    pub max_payload: usize,
    /// Depth of the inbound/outbound frame queues and of each guest write queue.
    pub queue_depth: usize,
    /// Read buffer size for guest sockets (one Data frame per read).
    pub guest_chunk_size: usize,
    /// Deadline for dialing a target or broker.
    pub dial_timeout: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(20)),
            max_payload: DEFAULT_MAX_PAYLOAD,
            queue_depth: 64,
            guest_chunk_size: 1024,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl ProtocolSettings {
    pub fn validate(&self) -> PortalResult<()> {
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(PortalError::Config("read/write timeouts must be non-zero".into()));
        }
        if self.dial_timeout.is_zero() {
            return Err(PortalError::Config("dial timeout must be non-zero".into()));
        }
        if self.queue_depth == 0 {
            return Err(PortalError::Config("queue_depth must be at least 1".into()));
        }
        if self.guest_chunk_size == 0 || self.guest_chunk_size > self.max_payload {
            return Err(PortalError::Config(format!(
                "guest_chunk_size must be between 1 and max_payload_bytes ({})",
                self.max_payload
            )));
        }
        if let Some(every) = self.keepalive_interval {
            if every >= self.read_timeout {
                tracing::warn!(
                    keepalive = ?every,
                    read_timeout = ?self.read_timeout,
                    "keepalive interval is not shorter than the read timeout; idle sessions will drop"
                );
            }
        }
        Ok(())
    }
}

/// `[protocol]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// 0 disables keepalive.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_guest_chunk_size")]
    pub guest_chunk_size: usize,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            keepalive_secs: default_keepalive(),
            max_payload_bytes: default_max_payload(),
            queue_depth: default_queue_depth(),
            guest_chunk_size: default_guest_chunk_size(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

fn default_read_timeout() -> u64 {
    30
}
fn default_write_timeout() -> u64 {
    30
}
fn default_keepalive() -> u64 {
    20
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}
fn default_queue_depth() -> usize {
    64
}
fn default_guest_chunk_size() -> usize {
    1024
}
fn default_dial_timeout() -> u64 {
    10
}

impl ProtocolSection {
    /// Convert to validated runtime settings.
    pub fn to_settings(&self) -> PortalResult<ProtocolSettings> {
        let settings = ProtocolSettings {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            keepalive_interval: match self.keepalive_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_payload: self.max_payload_bytes,
            queue_depth: self.queue_depth,
            guest_chunk_size: self.guest_chunk_size,
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
        };
        settings.validate()?;
        Ok(settings)
    }
}
