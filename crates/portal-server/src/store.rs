//! Auxiliary key-value store handle.
//!
//! The broker connects at startup and verifies the store answers `PING`.
//! Sessions never touch it.

use portal_core::{PortalError, PortalResult};
use redis::aio::MultiplexedConnection;
use tracing::info;

#[derive(Clone)]
pub struct AuxStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl AuxStore {
    /// Open a multiplexed connection to `address` and check it with `PING`.
    ///
    /// A bare `host:port` is accepted and treated as `redis://host:port`.
    pub async fn connect(address: &str, prefix: impl Into<String>) -> PortalResult<Self> {
        let url = normalize_address(address);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| PortalError::Store(format!("invalid store address {url}: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PortalError::Store(format!("cannot connect to {url}: {e}")))?;

        let store = Self {
            conn,
            prefix: prefix.into(),
        };
        store.ping().await?;
        info!(address = %url, prefix = %store.prefix, "auxiliary store connected");
        Ok(store)
    }

    pub async fn ping(&self) -> PortalResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| PortalError::Store(format!("PING failed: {e}")))?;
        if pong != "PONG" {
            return Err(PortalError::Store(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn normalize_address(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    }
}
