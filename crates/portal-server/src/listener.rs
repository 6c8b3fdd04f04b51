//! Public guest listener, one per ready host session.
//!
//! Binds an ephemeral port on the guest interface and hands every accepted
//! connection to the session's dispatch loop as an [`AcceptedGuest`]. The
//! accept loop runs in its own task and ends when the session closes.

use std::net::SocketAddr;
use std::time::Duration;

use portal_core::{CloseSignal, PortalResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A guest connection accepted on a host's public port.
#[derive(Debug)]
pub struct AcceptedGuest {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

pub struct GuestListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl GuestListener {
    /// Bind `host:0`.
    pub async fn bind(host: &str) -> PortalResult<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `closed` fires or `accepted` is dropped.
    /// The socket is closed when the loop ends.
    pub fn spawn(self, accepted: mpsc::Sender<AcceptedGuest>, closed: CloseSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let addr = self.local_addr;
            info!(addr = %addr, "guest listener started");
            accept_loop(self.listener, accepted, closed).await;
            debug!(addr = %addr, "guest listener stopped");
        })
    }
}

async fn accept_loop(listener: TcpListener, accepted: mpsc::Sender<AcceptedGuest>, closed: CloseSignal) {
    loop {
        tokio::select! {
            _ = closed.closed() => break,
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(peer = %peer_addr, "guest accepted");
                    if accepted.send(AcceptedGuest { stream, peer_addr }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "guest accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}
