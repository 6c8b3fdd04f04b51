//! Core broker: accepts host control connections and runs one
//! [`HostSession`] per host.
//!
//! Owns the broker-wide context: resolved config, the shared host settings,
//! the host admission limit and the optional auxiliary store.

use std::net::SocketAddr;
use std::sync::Arc;

use portal_core::{write_frame, Frame, PortalError, PortalResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, warn};

use crate::capacity::HostLimiter;
use crate::config::ServerConfig;
use crate::host::{HostSession, HostSettings};
use crate::store::AuxStore;

/// The portal broker instance.
pub struct PortalServer {
    config: ServerConfig,
    /// Settings handed to every host session.
    host_settings: Arc<HostSettings>,
    /// Live host count against `max_hosts`.
    limiter: Arc<HostLimiter>,
    /// Auxiliary store, when configured. Checked once at startup.
    store: Option<AuxStore>,
}

impl PortalServer {
    /// Build the server, connecting to the auxiliary store if one is configured.
    pub async fn new(config: ServerConfig) -> PortalResult<Self> {
        let store = match &config.store_address {
            Some(address) => Some(AuxStore::connect(address, config.store_prefix.clone()).await?),
            None => {
                debug!("no auxiliary store configured");
                None
            }
        };

        let host_settings = Arc::new(HostSettings {
            credential: config.credential.as_ref().map(|c| c.as_bytes().to_vec()),
            guest_bind: config.guest_bind.clone(),
            protocol: config.protocol.clone(),
        });
        if host_settings.credential.is_none() {
            warn!("no credential configured, any host will be accepted");
        }

        let limiter = Arc::new(HostLimiter::new(config.max_hosts));

        Ok(Self {
            config,
            host_settings,
            limiter,
            store,
        })
    }

    /// Bind the control port and serve forever.
    pub async fn run(self) -> PortalResult<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PortalError::Transport(format!("cannot bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Accept host connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> PortalResult<()> {
        info!(
            addr = %listener.local_addr()?,
            max_hosts = self.limiter.max_hosts(),
            store = self.store.as_ref().map(|s| s.prefix()).unwrap_or("none"),
            "broker listening"
        );

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "host accept failed");
                    time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            self.admit(stream, peer_addr);
        }
    }

    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let Some(guard) = self.limiter.try_acquire() else {
            warn!(peer = %peer_addr, active = self.limiter.active(), "broker at capacity, refusing host");
            let write_timeout = self.config.protocol.write_timeout;
            tokio::spawn(async move {
                let mut stream = stream;
                let refusal = Frame::error("broker at capacity");
                let _ = time::timeout(write_timeout, write_frame(&mut stream, &refusal)).await;
            });
            return;
        };

        let session = HostSession::new(stream, peer_addr.to_string(), self.host_settings.clone());
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _ = session.run().await;
            debug!(peer = %peer_addr, active = limiter.active().saturating_sub(1), "host slot released");
        });
    }
}
