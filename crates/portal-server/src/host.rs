//! Broker side of one host control connection.
//!
//! A [`HostSession`] authenticates the host, opens a public guest port for it,
//! then multiplexes every guest accepted on that port over the control
//! connection:
//!
//! ```text
//! Unauthed -> Authing -> Authed -> Ready -> Closed
//! ```
//!
//! The dispatch loop owns the guest registry and is the only task that
//! mutates it.

use std::sync::Arc;

use portal_core::{
    ControlChannel, Delivery, Frame, FrameKind, GuestLink, GuestRegistry, LinkReleased, PortalError,
    PortalResult, ProtocolSettings,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::listener::{AcceptedGuest, GuestListener};

/// Challenge text carried by the broker's `AuthRequest`.
pub const AUTH_CHALLENGE: &str = "portal auth";

/// Host session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Unauthed,
    Authing,
    Authed,
    Ready,
    Closed,
}

/// Settings shared by every host session of one broker.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Credential hosts must present in `AuthResponse`; `None` accepts any.
    pub credential: Option<Vec<u8>>,
    /// Interface guest ports are opened on.
    pub guest_bind: String,
    pub protocol: ProtocolSettings,
}

pub struct HostSession {
    peer: String,
    channel: ControlChannel,
    registry: GuestRegistry,
    settings: Arc<HostSettings>,
    state: watch::Sender<HostState>,
    meta: Option<String>,
}

impl HostSession {
    pub fn new<S>(stream: S, peer: impl Into<String>, settings: Arc<HostSettings>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let channel = ControlChannel::spawn(stream, peer.clone(), &settings.protocol);
        let (state, _) = watch::channel(HostState::Unauthed);
        Self {
            peer,
            channel,
            registry: GuestRegistry::new(),
            settings,
            state,
            meta: None,
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    /// Drive the session to completion.
    ///
    /// Returns an error when the handshake fails; a session that reached
    /// Ready ends with `Ok` whenever the host goes away.
    pub async fn run(mut self) -> PortalResult<()> {
        info!(peer = %self.peer, "host connected");

        let result = match self.handshake().await {
            Ok(listener) => {
                self.serve(listener).await;
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "host handshake failed");
                Err(e)
            }
        };

        let guests = self.registry.len();
        self.registry.close_all();
        self.channel.close();
        self.state.send_replace(HostState::Closed);
        info!(
            peer = %self.peer,
            meta = self.meta.as_deref().unwrap_or(""),
            guests,
            "host session closed"
        );
        result
    }

    async fn handshake(&mut self) -> PortalResult<GuestListener> {
        self.channel.send(Frame::auth_request(AUTH_CHALLENGE)).await;
        self.state.send_replace(HostState::Authing);

        let frame = self.channel.next_frame().await?;
        if frame.kind != FrameKind::AuthResponse {
            return self.refuse("expected AuthResponse").await;
        }
        if let Some(expected) = &self.settings.credential {
            if frame.payload != *expected {
                return self.refuse("authentication failed").await;
            }
        }
        self.state.send_replace(HostState::Authed);
        self.channel.send(Frame::ok("auth OK")).await;

        let frame = self.channel.next_frame().await?;
        if frame.kind != FrameKind::SessionMeta {
            return self.refuse("expected SessionMeta").await;
        }
        let meta = frame.payload_str().into_owned();
        debug!(peer = %self.peer, meta = %meta, "session metadata");
        self.meta = Some(meta);

        let listener = match GuestListener::bind(&self.settings.guest_bind).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(peer = %self.peer, bind = %self.settings.guest_bind, error = %e, "cannot open guest port");
                return self.refuse("error opening outside port").await;
            }
        };
        let public = listener.local_addr();
        self.channel
            .send(Frame::ok(format!("opened outside {public}")))
            .await;
        self.channel.start_keepalive();
        self.state.send_replace(HostState::Ready);
        info!(
            peer = %self.peer,
            public = %public,
            meta = self.meta.as_deref().unwrap_or(""),
            "host ready"
        );
        Ok(listener)
    }

    /// Tell the host why it is being dropped, then close.
    async fn refuse<T>(&mut self, reason: &str) -> PortalResult<T> {
        self.channel.send(Frame::error(reason)).await;
        self.channel.close();
        Err(PortalError::Protocol(reason.to_string()))
    }

    async fn serve(&mut self, listener: GuestListener) {
        let (accepted_tx, mut accepted_rx) = mpsc::channel::<AcceptedGuest>(self.settings.protocol.queue_depth);
        let (released_tx, mut released_rx) = mpsc::unbounded_channel::<LinkReleased>();
        let _accept_task = listener.spawn(accepted_tx, self.channel.close_signal());

        loop {
            tokio::select! {
                frame = self.channel.recv() => match frame {
                    Some(frame) => self.dispatch(frame).await,
                    None => break,
                },
                Some(guest) = accepted_rx.recv() => self.admit(guest, &released_tx).await,
                Some(notice) = released_rx.recv() => self.on_released(notice).await,
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        let id = frame.conn_id;
        match frame.kind {
            FrameKind::Ping => {}
            FrameKind::Data => match self.registry.deliver(id, frame.payload).await {
                Delivery::Delivered => {}
                Delivery::Unknown => {
                    debug!(peer = %self.peer, conn_id = id, "data for unknown guest");
                    self.channel.send(Frame::guest_disconnect(id)).await;
                }
                Delivery::Failed => {
                    debug!(peer = %self.peer, conn_id = id, "guest gone, dropping data");
                    self.channel.send(Frame::guest_disconnect(id)).await;
                }
            },
            FrameKind::GuestDisconnect => {
                if let Some(link) = self.registry.remove(id) {
                    link.close();
                    info!(peer = %self.peer, conn_id = id, guest = %link.peer(), "guest disconnected by host");
                }
            }
            FrameKind::AuthRequest
            | FrameKind::AuthResponse
            | FrameKind::Ok
            | FrameKind::Error
            | FrameKind::SessionMeta
            | FrameKind::GuestConnect => {
                warn!(peer = %self.peer, kind = %frame.kind, conn_id = id, "unexpected frame from host, ignoring");
            }
            FrameKind::Unknown(kind) => {
                warn!(peer = %self.peer, kind, conn_id = id, len = frame.payload.len(), "unknown frame kind from host, ignoring");
            }
        }
    }

    async fn admit(&mut self, guest: AcceptedGuest, released: &mpsc::UnboundedSender<LinkReleased>) {
        let id = self.registry.allocate_id(&mut rand::thread_rng());
        let serial = self.registry.next_serial();

        // GuestConnect must precede any Data the guest produces.
        if !self.channel.send(Frame::guest_connect(id)).await {
            return;
        }
        let link = GuestLink::spawn(
            id,
            serial,
            guest.peer_addr.to_string(),
            guest.stream,
            self.channel.outbound(),
            released.clone(),
            &self.settings.protocol,
        );
        self.registry.insert(link);
        info!(peer = %self.peer, conn_id = id, guest = %guest.peer_addr, "guest connected");
    }

    async fn on_released(&mut self, notice: LinkReleased) {
        if self.registry.release(&notice).is_some() {
            info!(peer = %self.peer, conn_id = notice.conn_id, "guest disconnected");
            self.channel.send(Frame::guest_disconnect(notice.conn_id)).await;
        }
    }
}
