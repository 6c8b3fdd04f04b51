//! Control channel pump: the reader / writer / keepalive task triad.
//!
//! Every session owns one [`ControlChannel`] wrapping its control socket:
//!
//! - **Reader**: decodes frames under the read deadline and pushes them to
//!   the inbound queue. EOF, a decode error or an expired deadline closes
//!   the session.
//! - **Writer**: pops frames from the outbound queue and writes them under the
//!   write deadline. Frames queued before a close are still written, then the
//!   socket is shut down.
//! - **Keepalive**: periodically queues a `Ping` so idle links never hit the
//!   peer's read deadline.
//!
//! All three stop when the session's [`CloseSignal`] fires.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::config::ProtocolSettings;
use crate::error::{PortalError, PortalResult};
use crate::frame::{Frame, FrameKind};
use crate::signal::CloseSignal;

/// Cloneable handle for queueing frames toward the peer.
///
/// Sends are best-effort: once the session is closed they are dropped and
/// reported as `false` instead of failing loudly.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Frame>,
    closed: CloseSignal,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Frame>, closed: CloseSignal) -> Self {
        Self { tx, closed }
    }

    /// Queue a frame. Waits for queue space; gives up if the session closes.
    pub async fn send(&self, frame: Frame) -> bool {
        if self.closed.is_closed() {
            trace!(kind = %frame.kind, conn_id = frame.conn_id, "session closed, dropping frame");
            return false;
        }
        tokio::select! {
            res = self.tx.send(frame) => res.is_ok(),
            _ = self.closed.closed() => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// One control connection with its reader, writer and optional keepalive.
pub struct ControlChannel {
    peer: String,
    inbound: mpsc::Receiver<Frame>,
    outbound: Outbound,
    closed: CloseSignal,
    keepalive_interval: Option<Duration>,
    keepalive: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Split `stream` and start the reader and writer tasks.
    ///
    /// Keepalive is not started here; see [`ControlChannel::start_keepalive`].
    pub fn spawn<S>(stream: S, peer: impl Into<String>, settings: &ProtocolSettings) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let closed = CloseSignal::new();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Frame>(settings.queue_depth);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(settings.queue_depth);
        let (read_half, write_half) = tokio::io::split(stream);

        tokio::spawn(read_loop(
            read_half,
            inbound_tx,
            closed.clone(),
            settings.read_timeout,
            settings.max_payload,
            peer.clone(),
        ));
        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            closed.clone(),
            settings.write_timeout,
            peer.clone(),
        ));

        Self {
            peer,
            inbound: inbound_rx,
            outbound: Outbound::new(outbound_tx, closed.clone()),
            closed,
            keepalive_interval: settings.keepalive_interval,
            keepalive: None,
        }
    }

    /// Start the keepalive task if enabled and not already running.
    pub fn start_keepalive(&mut self) {
        if self.keepalive.is_some() {
            return;
        }
        if let Some(every) = self.keepalive_interval {
            let outbound = self.outbound.clone();
            let closed = self.closed.clone();
            let peer = self.peer.clone();
            self.keepalive = Some(tokio::spawn(keepalive_loop(outbound, closed, every, peer)));
        }
    }

    /// Next inbound frame, or `None` once the channel is closed.
    ///
    /// Frames already queued when the channel closes are still delivered.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.inbound.recv() => frame,
            _ = self.closed.closed() => None,
        }
    }

    /// Next frame that carries meaning, skipping `Ping`.
    pub async fn next_frame(&mut self) -> PortalResult<Frame> {
        loop {
            match self.recv().await {
                Some(frame) if frame.kind == FrameKind::Ping => continue,
                Some(frame) => return Ok(frame),
                None => return Err(PortalError::ConnectionClosed),
            }
        }
    }

    pub async fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).await
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        if self.closed.close() {
            debug!(peer = %self.peer, "control channel closing");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<Frame>,
    closed: CloseSignal,
    read_timeout: Duration,
    max_payload: usize,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.closed() => break,
            res = time::timeout(read_timeout, codec::read_frame(&mut reader, max_payload)) => {
                match res {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(PortalError::ConnectionClosed)) => {
                        debug!(peer = %peer, "control connection closed by peer");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(peer = %peer, error = %e, "control read failed");
                        break;
                    }
                    Err(_) => {
                        warn!(peer = %peer, timeout = ?read_timeout, "control read deadline expired");
                        break;
                    }
                }
            }
        };

        trace!(peer = %peer, kind = %frame.kind, conn_id = frame.conn_id, len = frame.payload.len(), "frame in");

        tokio::select! {
            _ = closed.closed() => break,
            res = inbound.send(frame) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }

    closed.close();
    debug!(peer = %peer, "control reader stopped");
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Frame>,
    closed: CloseSignal,
    write_timeout: Duration,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.closed() => break,
        };

        trace!(peer = %peer, kind = %frame.kind, conn_id = frame.conn_id, len = frame.payload.len(), "frame out");

        match time::timeout(write_timeout, codec::write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "control write failed");
                closed.close();
                break;
            }
            Err(_) => {
                warn!(peer = %peer, timeout = ?write_timeout, "control write deadline expired");
                closed.close();
                break;
            }
        }
    }

    // The pump stops only when the session is going away.
    closed.close();
    let _ = time::timeout(write_timeout, writer.shutdown()).await;
    debug!(peer = %peer, "control writer stopped");
}

async fn keepalive_loop(outbound: Outbound, closed: CloseSignal, every: Duration, peer: String) {
    let mut ticker = time::interval(every);
    ticker.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            _ = closed.closed() => break,
            _ = ticker.tick() => {
                if !outbound.send(Frame::ping()).await {
                    break;
                }
            }
        }
    }

    debug!(peer = %peer, "keepalive loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{frame_encode, read_frame, DEFAULT_MAX_PAYLOAD};
    use tokio::io::AsyncWriteExt;

    fn fast_settings(keepalive: Option<Duration>) -> ProtocolSettings {
        ProtocolSettings {
            read_timeout: Duration::from_millis(300),
            write_timeout: Duration::from_millis(300),
            keepalive_interval: keepalive,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn frames_cross_in_order() {
        let (a, b) = tokio::io::duplex(4096);
        let settings = ProtocolSettings::default();
        let left = ControlChannel::spawn(a, "left", &settings);
        let mut right = ControlChannel::spawn(b, "right", &settings);

        for i in 1..=100u32 {
            assert!(left.send(Frame::data(i, i.to_be_bytes().to_vec())).await);
        }
        for i in 1..=100u32 {
            let frame = right.recv().await.expect("frame");
            assert_eq!(frame.conn_id, i);
            assert_eq!(frame.payload, i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn next_frame_skips_pings() {
        let (a, b) = tokio::io::duplex(4096);
        let settings = ProtocolSettings::default();
        let left = ControlChannel::spawn(a, "left", &settings);
        let mut right = ControlChannel::spawn(b, "right", &settings);

        left.send(Frame::ping()).await;
        left.send(Frame::ping()).await;
        left.send(Frame::session_meta("game-x")).await;

        let frame = right.next_frame().await.unwrap();
        assert_eq!(frame.kind, FrameKind::SessionMeta);
    }

    #[tokio::test]
    async fn keepalive_keeps_idle_pair_open() {
        let (a, b) = tokio::io::duplex(4096);
        let settings = fast_settings(Some(Duration::from_millis(50)));
        let mut left = ControlChannel::spawn(a, "left", &settings);
        let mut right = ControlChannel::spawn(b, "right", &settings);
        left.start_keepalive();
        right.start_keepalive();

        time::sleep(Duration::from_millis(1000)).await;
        assert!(!left.is_closed());
        assert!(!right.is_closed());
    }

    #[tokio::test]
    async fn idle_pair_without_keepalive_closes() {
        let (a, b) = tokio::io::duplex(4096);
        let settings = fast_settings(None);
        let mut left = ControlChannel::spawn(a, "left", &settings);
        let mut right = ControlChannel::spawn(b, "right", &settings);
        left.start_keepalive();
        right.start_keepalive();

        let closed = time::timeout(Duration::from_secs(2), async {
            assert!(left.recv().await.is_none());
            assert!(right.recv().await.is_none());
        })
        .await;
        assert!(closed.is_ok(), "both sides should hit the read deadline");
    }

    #[tokio::test]
    async fn garbage_closes_channel() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut channel = ControlChannel::spawn(a, "peer", &ProtocolSettings::default());

        // declared length far beyond the payload cap
        b.write_all(&[0, 8, 0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();

        let frame = time::timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
        assert!(frame.is_none());
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn queued_frames_flush_before_shutdown() {
        let (a, mut b) = tokio::io::duplex(4096);
        let channel = ControlChannel::spawn(a, "peer", &ProtocolSettings::default());

        assert!(channel.send(Frame::error("expected AuthResponse")).await);
        channel.close();
        assert!(!channel.send(Frame::ok("too late")).await);

        let frame = read_frame(&mut b, DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert_eq!(frame, Frame::error("expected AuthResponse"));
        assert!(matches!(
            read_frame(&mut b, DEFAULT_MAX_PAYLOAD).await,
            Err(PortalError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn peer_frames_reach_inbound() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut channel = ControlChannel::spawn(a, "peer", &ProtocolSettings::default());

        let bytes = frame_encode(&Frame::auth_response(b"token".to_vec())).unwrap();
        b.write_all(&bytes).await.unwrap();
        drop(b);

        let frame = channel.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::AuthResponse);
        assert_eq!(frame.payload, b"token");
        assert!(channel.recv().await.is_none());
    }
}
