//! Bridge side of the control connection.
//!
//! A [`TunnelSession`] answers the broker's challenge, registers its session
//! metadata, and then serves guests: every `GuestConnect` dials the private
//! target and every `Data` frame is routed to the matching guest link.
//!
//! ```text
//! Init -> Authing -> Authed -> Ready -> Closed
//! ```

use std::time::Duration;

use portal_core::{
    ConnId, ControlChannel, Delivery, Frame, FrameKind, GuestLink, GuestRegistry, LinkReleased, PortalError,
    PortalResult, ProtocolSettings, CONTROL_CONN_ID,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

/// Prefix of the broker's final `Ok`; the public address follows it.
const OPENED_PREFIX: &str = "opened outside ";

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// `host:port` of the private service guests are relayed to.
    pub target: String,
    /// Opaque credential sent in `AuthResponse`.
    pub credential: Vec<u8>,
    /// Free-form session metadata sent in `SessionMeta`.
    pub meta: String,
    pub protocol: ProtocolSettings,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            target: "127.0.0.1:8080".to_string(),
            credential: Vec::new(),
            meta: String::new(),
            protocol: ProtocolSettings::default(),
        }
    }
}

/// Bridge session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    Authing,
    Authed,
    Ready,
    Closed,
}

/// Snapshot published to [`TunnelSession::subscribe`] watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    /// Public guest address reported by the broker, once Ready.
    pub public_addr: Option<String>,
}

pub struct TunnelSession {
    peer: String,
    channel: ControlChannel,
    registry: GuestRegistry,
    config: TunnelConfig,
    status: watch::Sender<TunnelStatus>,
}

impl TunnelSession {
    /// Dial `broker` (bounded by the dial timeout) and wrap the connection.
    pub async fn connect(broker: &str, config: TunnelConfig) -> PortalResult<Self> {
        let stream = time::timeout(config.protocol.dial_timeout, TcpStream::connect(broker))
            .await?
            .map_err(|e| PortalError::Transport(format!("cannot reach broker {broker}: {e}")))?;
        let _ = stream.set_nodelay(true);
        info!(broker = %broker, "connected to broker");
        Ok(Self::new(stream, broker, config))
    }

    /// Wrap an established control connection. Keepalive starts immediately.
    pub fn new<S>(stream: S, peer: impl Into<String>, config: TunnelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let mut channel = ControlChannel::spawn(stream, peer.clone(), &config.protocol);
        channel.start_keepalive();
        let (status, _) = watch::channel(TunnelStatus {
            state: TunnelState::Init,
            public_addr: None,
        });
        Self {
            peer,
            channel,
            registry: GuestRegistry::new(),
            config,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> TunnelState {
        self.status.borrow().state
    }

    /// Drive the session until the broker goes away or misbehaves.
    ///
    /// `Err(Rejected)` means the broker sent an `Error` frame.
    pub async fn run(mut self) -> PortalResult<()> {
        let result = match self.handshake().await {
            Ok(()) => self.serve().await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(broker = %self.peer, error = %e, "tunnel session failed");
        }
        self.registry.close_all();
        self.channel.close();
        self.set_state(TunnelState::Closed);
        info!(broker = %self.peer, "tunnel session closed");
        result
    }

    fn set_state(&self, state: TunnelState) {
        self.status.send_modify(|s| s.state = state);
    }

    async fn handshake(&mut self) -> PortalResult<()> {
        let frame = self.channel.next_frame().await?;
        match frame.kind {
            FrameKind::AuthRequest => {}
            // e.g. a broker refusing hosts beyond its capacity
            FrameKind::Error => return Err(PortalError::Rejected(frame.payload_str().into_owned())),
            other => {
                return Err(PortalError::Protocol(format!("expected AuthRequest, got {other}")));
            }
        }
        debug!(broker = %self.peer, challenge = %frame.payload_str(), "auth requested");
        self.channel
            .send(Frame::auth_response(self.config.credential.clone()))
            .await;
        self.set_state(TunnelState::Authing);

        let frame = self.channel.next_frame().await?;
        expect_ok(&frame, "authenticating")?;
        self.channel
            .send(Frame::session_meta(self.config.meta.clone()))
            .await;
        self.set_state(TunnelState::Authed);

        let frame = self.channel.next_frame().await?;
        expect_ok(&frame, "opening the public port")?;
        let public_addr = parse_public_addr(&frame.payload_str());
        match &public_addr {
            Some(addr) => info!(broker = %self.peer, public = %addr, target = %self.config.target, "tunnel ready"),
            None => warn!(broker = %self.peer, reply = %frame.payload_str(), "broker did not report a public address"),
        }
        self.status.send_replace(TunnelStatus {
            state: TunnelState::Ready,
            public_addr,
        });
        Ok(())
    }

    async fn serve(&mut self) -> PortalResult<()> {
        let (released_tx, mut released_rx) = mpsc::unbounded_channel::<LinkReleased>();

        loop {
            tokio::select! {
                frame = self.channel.recv() => match frame {
                    Some(frame) => self.dispatch(frame, &released_tx).await?,
                    None => return Ok(()),
                },
                Some(notice) = released_rx.recv() => self.on_released(notice).await,
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame, released: &mpsc::UnboundedSender<LinkReleased>) -> PortalResult<()> {
        let id = frame.conn_id;
        match frame.kind {
            FrameKind::Ping => {}
            FrameKind::Error => {
                return Err(PortalError::Rejected(frame.payload_str().into_owned()));
            }
            FrameKind::GuestConnect => {
                if id == CONTROL_CONN_ID {
                    return Err(PortalError::Protocol("GuestConnect with connection id 0".into()));
                }
                self.open_guest(id, released).await;
            }
            FrameKind::GuestDisconnect => {
                if let Some(link) = self.registry.remove(id) {
                    link.close();
                    info!(conn_id = id, "guest disconnected");
                }
            }
            FrameKind::Data => match self.registry.deliver(id, frame.payload).await {
                Delivery::Delivered => {}
                Delivery::Unknown | Delivery::Failed => {
                    debug!(conn_id = id, "data for unknown guest");
                    self.channel.send(Frame::guest_disconnect(id)).await;
                }
            },
            FrameKind::AuthRequest
            | FrameKind::AuthResponse
            | FrameKind::Ok
            | FrameKind::SessionMeta
            | FrameKind::Unknown(_) => {
                return Err(PortalError::Protocol(format!(
                    "unexpected {} after the tunnel is ready",
                    frame.kind
                )));
            }
        }
        Ok(())
    }

    /// Dial the target for a new guest. Blocks dispatch for at most the dial
    /// timeout so Data for this id cannot arrive before the link exists.
    async fn open_guest(&mut self, id: ConnId, released: &mpsc::UnboundedSender<LinkReleased>) {
        if let Some(old) = self.registry.remove(id) {
            debug!(conn_id = id, "guest id reused, replacing link");
            old.close();
        }

        let stream = match dial(&self.config.target, self.config.protocol.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(conn_id = id, target = %self.config.target, error = %e, "cannot reach target");
                self.channel.send(Frame::guest_disconnect(id)).await;
                return;
            }
        };

        let serial = self.registry.next_serial();
        let link = GuestLink::spawn(
            id,
            serial,
            self.config.target.clone(),
            stream,
            self.channel.outbound(),
            released.clone(),
            &self.config.protocol,
        );
        self.registry.insert(link);
        info!(conn_id = id, target = %self.config.target, "guest connected");
    }

    async fn on_released(&mut self, notice: LinkReleased) {
        if self.registry.release(&notice).is_some() {
            info!(conn_id = notice.conn_id, "target closed guest connection");
            self.channel.send(Frame::guest_disconnect(notice.conn_id)).await;
        }
    }
}

async fn dial(target: &str, within: Duration) -> PortalResult<TcpStream> {
    let stream = time::timeout(within, TcpStream::connect(target)).await??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// `Ok` moves the handshake forward; `Error` is a rejection; anything else
/// is a protocol violation.
fn expect_ok(frame: &Frame, step: &str) -> PortalResult<()> {
    match frame.kind {
        FrameKind::Ok => Ok(()),
        FrameKind::Error => Err(PortalError::Rejected(frame.payload_str().into_owned())),
        other => Err(PortalError::Protocol(format!("unexpected {other} while {step}"))),
    }
}

fn parse_public_addr(reply: &str) -> Option<String> {
    reply
        .strip_prefix(OPENED_PREFIX)
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
}
