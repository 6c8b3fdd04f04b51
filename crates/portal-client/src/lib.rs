//! portal-client: bridge engine for the portal reverse tunnel.
//!
//! Connects to a broker, authenticates, and serves every guest the broker
//! announces by dialing a private target and relaying bytes both ways.
//!
//! # Quick Start
//!
//! ```no_run
//! use portal_client::{TunnelConfig, TunnelSession};
//!
//! # async fn example() -> portal_core::PortalResult<()> {
//! let session = TunnelSession::connect("broker.example.com:9000", TunnelConfig {
//!     target: "127.0.0.1:25565".into(),
//!     meta: "game-x".into(),
//!     ..Default::default()
//! }).await?;
//!
//! let mut status = session.subscribe();
//! tokio::spawn(async move {
//!     if let Ok(s) = status.wait_for(|s| s.public_addr.is_some()).await {
//!         println!("public address: {:?}", s.public_addr);
//!     }
//! });
//!
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod tunnel;

// Re-export primary public types.
pub use tunnel::{TunnelConfig, TunnelSession, TunnelState, TunnelStatus};

// Re-export portal-core error types for convenience.
pub use portal_core::{PortalError, PortalResult};
