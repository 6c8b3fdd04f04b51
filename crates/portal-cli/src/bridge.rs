//! `portal` run loop: connect, serve, optionally reconnect.

use anyhow::{Context, Result};
use portal_client::{PortalError, TunnelSession, TunnelState};
use tracing::{info, warn};

use crate::config::BridgeSettings;

/// Serve the target through the broker until the session ends, retrying
/// after `settings.reconnect` when configured.
pub async fn run(settings: &BridgeSettings) -> Result<()> {
    loop {
        let outcome = run_once(settings).await;

        let Some(delay) = settings.reconnect else {
            return outcome;
        };
        match &outcome {
            Ok(()) => info!(broker = %settings.broker, "session ended"),
            Err(e) => warn!(broker = %settings.broker, "session ended: {e:#}"),
        }
        info!(delay_secs = delay.as_secs(), "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn run_once(settings: &BridgeSettings) -> Result<()> {
    info!(broker = %settings.broker, target = %settings.tunnel.target, "connecting");
    let session = TunnelSession::connect(&settings.broker, settings.tunnel.clone())
        .await
        .with_context(|| format!("failed to connect to broker {}", settings.broker))?;

    let mut status = session.subscribe();
    let reporter = tokio::spawn(async move {
        if let Ok(s) = status.wait_for(|s| s.state == TunnelState::Ready).await {
            match &s.public_addr {
                Some(addr) => println!("portal open at {addr}"),
                None => println!("portal open"),
            }
        }
    });

    let result = session.run().await;
    reporter.abort();

    match result {
        Ok(()) => Ok(()),
        Err(PortalError::Rejected(reason)) => anyhow::bail!("broker refused the session: {reason}"),
        Err(e) => Err(e).context("tunnel session failed"),
    }
}
