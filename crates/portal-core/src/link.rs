//! One guest link: a local TCP-like stream bound to a connection id.
//!
//! Bytes read from the stream leave as `Data` frames through the session's
//! [`Outbound`] handle. Bytes arriving for the link are queued with
//! [`GuestLink::forward`] and written by a dedicated task, so a slow guest
//! never blocks the session's dispatch loop.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::ProtocolSettings;
use crate::error::{PortalError, PortalResult};
use crate::frame::{ConnId, Frame};
use crate::pump::Outbound;
use crate::signal::CloseSignal;

/// Emitted when a link fails on its own (EOF, read or write error).
///
/// The session's dispatch loop deregisters the link and tells the peer. The
/// serial distinguishes this link from a later one reusing the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkReleased {
    pub conn_id: ConnId,
    pub serial: u64,
}

/// Handle to a running guest link. Dropping it closes the link.
#[derive(Debug)]
pub struct GuestLink {
    conn_id: ConnId,
    serial: u64,
    peer: String,
    write_tx: mpsc::Sender<Vec<u8>>,
    closed: CloseSignal,
}

impl GuestLink {
    /// Start the read and write tasks for `stream`.
    pub fn spawn<S>(
        conn_id: ConnId,
        serial: u64,
        peer: impl Into<String>,
        stream: S,
        outbound: Outbound,
        released: mpsc::UnboundedSender<LinkReleased>,
        settings: &ProtocolSettings,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let closed = CloseSignal::new();
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(settings.queue_depth);
        let (read_half, write_half) = tokio::io::split(stream);
        let notice = LinkReleased { conn_id, serial };

        tokio::spawn(guest_read_loop(
            read_half,
            outbound,
            closed.clone(),
            released.clone(),
            notice,
            settings.guest_chunk_size,
        ));
        tokio::spawn(guest_write_loop(
            write_half,
            write_rx,
            closed.clone(),
            released,
            notice,
            settings.write_timeout,
        ));

        debug!(conn_id, serial, peer = %peer, "guest link up");

        Self {
            conn_id,
            serial,
            peer,
            write_tx,
            closed,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue bytes for the guest. Waits while the write queue is full.
    pub async fn forward(&self, bytes: Vec<u8>) -> PortalResult<()> {
        if self.closed.is_closed() {
            return Err(PortalError::LinkClosed(self.conn_id));
        }
        tokio::select! {
            res = self.write_tx.send(bytes) => {
                res.map_err(|_| PortalError::LinkClosed(self.conn_id))
            }
            _ = self.closed.closed() => Err(PortalError::LinkClosed(self.conn_id)),
        }
    }

    /// Close the link without notifying the session. Idempotent.
    pub fn close(&self) {
        if self.closed.close() {
            debug!(conn_id = self.conn_id, serial = self.serial, "guest link closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl Drop for GuestLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Close the link from inside one of its tasks and notify the session.
fn release_locally(closed: &CloseSignal, released: &mpsc::UnboundedSender<LinkReleased>, notice: LinkReleased) {
    if closed.close() {
        let _ = released.send(notice);
    }
}

async fn guest_read_loop<R>(
    mut reader: R,
    outbound: Outbound,
    closed: CloseSignal,
    released: mpsc::UnboundedSender<LinkReleased>,
    notice: LinkReleased,
    chunk_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = tokio::select! {
            _ = closed.closed() => return,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    debug!(conn_id = notice.conn_id, "guest closed its side");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(conn_id = notice.conn_id, error = %e, "guest read failed");
                    break;
                }
            },
        };

        trace!(conn_id = notice.conn_id, bytes = n, "guest -> session");
        if !outbound.send(Frame::data(notice.conn_id, buf[..n].to_vec())).await {
            // Session is gone; nothing left to notify.
            closed.close();
            return;
        }
    }

    release_locally(&closed, &released, notice);
}

async fn guest_write_loop<W>(
    mut writer: W,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    closed: CloseSignal,
    released: mpsc::UnboundedSender<LinkReleased>,
    notice: LinkReleased,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = tokio::select! {
            biased;
            bytes = write_rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
            _ = closed.closed() => break,
        };

        match time::timeout(write_timeout, writer.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = notice.conn_id, error = %e, "guest write failed");
                release_locally(&closed, &released, notice);
                break;
            }
            Err(_) => {
                warn!(conn_id = notice.conn_id, timeout = ?write_timeout, "guest write deadline expired");
                release_locally(&closed, &released, notice);
                break;
            }
        }
    }

    let _ = time::timeout(write_timeout, writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    struct Harness {
        link: GuestLink,
        guest: tokio::io::DuplexStream,
        frames: mpsc::Receiver<Frame>,
        released: mpsc::UnboundedReceiver<LinkReleased>,
        _session: CloseSignal,
    }

    fn harness(conn_id: ConnId, serial: u64) -> Harness {
        harness_with(conn_id, serial, 8192, ProtocolSettings::default())
    }

    fn harness_with(conn_id: ConnId, serial: u64, buffer: usize, settings: ProtocolSettings) -> Harness {
        let (ours, guest) = tokio::io::duplex(buffer);
        let (frame_tx, frames) = mpsc::channel(16);
        let (released_tx, released) = mpsc::unbounded_channel();
        let session = CloseSignal::new();
        let outbound = Outbound::new(frame_tx, session.clone());
        let link = GuestLink::spawn(conn_id, serial, "test-guest", ours, outbound, released_tx, &settings);
        Harness {
            link,
            guest,
            frames,
            released,
            _session: session,
        }
    }

    #[tokio::test]
    async fn guest_bytes_become_data_frames() {
        let mut h = harness(7, 1);
        h.guest.write_all(b"hello").await.unwrap();

        let frame = h.frames.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.conn_id, 7);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn reads_are_chunked() {
        let mut h = harness(3, 1);
        let blob = vec![0x5A; 3000];
        h.guest.write_all(&blob).await.unwrap();

        let mut got = Vec::new();
        while got.len() < blob.len() {
            let frame = h.frames.recv().await.unwrap();
            assert!(frame.payload.len() <= 1024);
            got.extend(frame.payload);
        }
        assert_eq!(got, blob);
    }

    #[tokio::test]
    async fn forwarded_bytes_reach_guest() {
        let mut h = harness(9, 1);
        h.link.forward(b"abc".to_vec()).await.unwrap();
        h.link.forward(b"def".to_vec()).await.unwrap();

        let mut buf = [0u8; 6];
        h.guest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[tokio::test]
    async fn guest_eof_releases_once() {
        let mut h = harness(11, 4);
        drop(h.guest);

        let notice = h.released.recv().await.unwrap();
        assert_eq!(notice, LinkReleased { conn_id: 11, serial: 4 });
        assert!(h.link.is_closed());

        // Both tasks have ended; the sender side is gone and nothing else arrives.
        assert!(h.released.recv().await.is_none());
        assert!(matches!(
            h.link.forward(b"late".to_vec()).await,
            Err(PortalError::LinkClosed(11))
        ));
    }

    #[tokio::test]
    async fn write_deadline_releases_link() {
        let settings = ProtocolSettings {
            write_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        // The guest never reads, so the second half of the write stalls.
        let mut h = harness_with(1, 1, 16, settings);
        h.link.forward(vec![0x11; 32]).await.unwrap();

        let notice = time::timeout(Duration::from_secs(2), h.released.recv())
            .await
            .unwrap();
        assert_eq!(notice, Some(LinkReleased { conn_id: 1, serial: 1 }));
        assert!(h.link.is_closed());
        assert!(h.released.recv().await.is_none());
        assert!(matches!(
            h.link.forward(b"late".to_vec()).await,
            Err(PortalError::LinkClosed(1))
        ));
    }

    #[tokio::test]
    async fn explicit_close_does_not_notify() {
        let mut h = harness(5, 2);
        h.link.close();
        h.link.close();

        // Guest sees EOF after the writer shuts down.
        let mut buf = Vec::new();
        time::timeout(Duration::from_secs(1), h.guest.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.is_empty());
        assert!(h.released.recv().await.is_none());
    }

    #[tokio::test]
    async fn drop_closes_link() {
        let mut h = harness(6, 1);
        drop(h.link);

        let mut buf = Vec::new();
        time::timeout(Duration::from_secs(1), h.guest.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(h.released.recv().await.is_none());
    }
}
