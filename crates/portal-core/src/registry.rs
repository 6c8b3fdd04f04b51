//! Connection-id registry for one session.
//!
//! Owned by the session's dispatch loop, so it needs no locking. Every guest
//! link lives here under its `conn_id`; ids are unique among live links.

use std::collections::HashMap;

use rand::RngCore;
use tracing::debug;

use crate::frame::{ConnId, CONTROL_CONN_ID};
use crate::link::{GuestLink, LinkReleased};

/// Outcome of [`GuestRegistry::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Bytes were queued for the guest.
    Delivered,
    /// No live link under that id.
    Unknown,
    /// The link had already closed; it has been removed.
    Failed,
}

#[derive(Debug, Default)]
pub struct GuestRegistry {
    links: HashMap<ConnId, GuestLink>,
    next_serial: u64,
}

impl GuestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a random non-zero id not held by a live link.
    pub fn allocate_id<R: RngCore + ?Sized>(&self, rng: &mut R) -> ConnId {
        loop {
            let id = rng.next_u32();
            if id != CONTROL_CONN_ID && !self.links.contains_key(&id) {
                return id;
            }
        }
    }

    /// Serial for the next link; never repeats within a session.
    pub fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Register `link`, returning the link it displaced (if any).
    pub fn insert(&mut self, link: GuestLink) -> Option<GuestLink> {
        self.links.insert(link.conn_id(), link)
    }

    pub fn get(&self, id: ConnId) -> Option<&GuestLink> {
        self.links.get(&id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<GuestLink> {
        self.links.remove(&id)
    }

    /// Remove the link named by a release notice, unless the id has since
    /// been taken by a newer link.
    pub fn release(&mut self, notice: &LinkReleased) -> Option<GuestLink> {
        match self.links.get(&notice.conn_id) {
            Some(link) if link.serial() == notice.serial => self.links.remove(&notice.conn_id),
            Some(_) => {
                debug!(conn_id = notice.conn_id, serial = notice.serial, "stale release ignored");
                None
            }
            None => None,
        }
    }

    /// Queue `bytes` for the link under `id`.
    pub async fn deliver(&mut self, id: ConnId, bytes: Vec<u8>) -> Delivery {
        let Some(link) = self.links.get(&id) else {
            return Delivery::Unknown;
        };
        match link.forward(bytes).await {
            Ok(()) => Delivery::Delivered,
            Err(_) => {
                if let Some(link) = self.links.remove(&id) {
                    link.close();
                }
                Delivery::Failed
            }
        }
    }

    /// Close and drop every link.
    pub fn close_all(&mut self) {
        for (_, link) in self.links.drain() {
            link.close();
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl Drop for GuestRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolSettings;
    use crate::frame::{Frame, FrameKind};
    use crate::pump::Outbound;
    use crate::signal::CloseSignal;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    /// Yields a fixed sequence of u32 values.
    struct Scripted(Vec<u32>);

    impl RngCore for Scripted {
        fn next_u32(&mut self) -> u32 {
            self.0.remove(0)
        }
        fn next_u64(&mut self) -> u64 {
            self.next_u32() as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    struct Session {
        registry: GuestRegistry,
        outbound: Outbound,
        frames: mpsc::Receiver<Frame>,
        released_tx: mpsc::UnboundedSender<LinkReleased>,
        released: mpsc::UnboundedReceiver<LinkReleased>,
        _closed: CloseSignal,
    }

    impl Session {
        fn new() -> Self {
            let (tx, frames) = mpsc::channel(64);
            let closed = CloseSignal::new();
            let (released_tx, released) = mpsc::unbounded_channel();
            Self {
                registry: GuestRegistry::new(),
                outbound: Outbound::new(tx, closed.clone()),
                frames,
                released_tx,
                released,
                _closed: closed,
            }
        }

        fn attach(&mut self, id: ConnId) -> DuplexStream {
            let (ours, theirs) = tokio::io::duplex(4096);
            let serial = self.registry.next_serial();
            let link = GuestLink::spawn(
                id,
                serial,
                format!("guest-{id}"),
                ours,
                self.outbound.clone(),
                self.released_tx.clone(),
                &ProtocolSettings::default(),
            );
            assert!(self.registry.insert(link).is_none());
            theirs
        }
    }

    #[tokio::test]
    async fn allocate_skips_zero_and_live_ids() {
        let mut s = Session::new();
        let _guest = s.attach(5);

        let mut rng = Scripted(vec![0, 5, 0, 5, 77]);
        assert_eq!(s.registry.allocate_id(&mut rng), 77);
    }

    #[test]
    fn allocated_ids_are_non_zero() {
        let registry = GuestRegistry::new();
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            assert_ne!(registry.allocate_id(&mut rng), CONTROL_CONN_ID);
        }
    }

    #[test]
    fn serials_increase() {
        let mut registry = GuestRegistry::new();
        let a = registry.next_serial();
        let b = registry.next_serial();
        assert!(b > a);
    }

    #[tokio::test]
    async fn deliver_to_unknown_id() {
        let mut s = Session::new();
        assert_eq!(s.registry.deliver(99, b"x".to_vec()).await, Delivery::Unknown);
    }

    #[tokio::test]
    async fn links_are_isolated() {
        let mut s = Session::new();
        let mut a = s.attach(1);
        let mut b = s.attach(2);
        assert_eq!(s.registry.len(), 2);

        assert_eq!(s.registry.deliver(1, b"for-a".to_vec()).await, Delivery::Delivered);
        assert_eq!(s.registry.deliver(2, b"for-b".to_vec()).await, Delivery::Delivered);

        let mut buf = [0u8; 5];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"for-a");
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"for-b");

        b.write_all(b"from-b").await.unwrap();
        let frame = s.frames.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.conn_id, 2);
        assert_eq!(frame.payload, b"from-b");

        // Closing one link leaves the other alone.
        s.registry.remove(1).unwrap().close();
        assert!(!s.registry.contains(1));
        assert!(s.registry.contains(2));
        assert_eq!(s.registry.deliver(2, b"still".to_vec()).await, Delivery::Delivered);
    }

    #[tokio::test]
    async fn deliver_to_closed_link_removes_it() {
        let mut s = Session::new();
        let _guest = s.attach(3);
        s.registry.get(3).unwrap().close();

        assert_eq!(s.registry.deliver(3, b"late".to_vec()).await, Delivery::Failed);
        assert!(!s.registry.contains(3));
    }

    #[tokio::test]
    async fn stale_release_keeps_newer_link() {
        let mut s = Session::new();
        let guest = s.attach(8);
        let old_serial = s.registry.get(8).unwrap().serial();

        // Replace id 8 with a newer link, then let the old guest hang up.
        let old = s.registry.remove(8).unwrap();
        let _newer = s.attach(8);
        drop(guest);
        drop(old);

        let stale = LinkReleased {
            conn_id: 8,
            serial: old_serial,
        };
        assert!(s.registry.release(&stale).is_none());
        assert!(s.registry.contains(8));

        let current = LinkReleased {
            conn_id: 8,
            serial: s.registry.get(8).unwrap().serial(),
        };
        assert!(s.registry.release(&current).is_some());
        assert!(s.registry.is_empty());
    }

    #[tokio::test]
    async fn guest_hangup_is_reported() {
        let mut s = Session::new();
        let guest = s.attach(4);
        drop(guest);

        let notice = s.released.recv().await.unwrap();
        assert_eq!(notice.conn_id, 4);
        assert!(s.registry.release(&notice).is_some());
        assert!(s.registry.is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let mut s = Session::new();
        let mut a = s.attach(1);
        let _b = s.attach(2);
        s.registry.close_all();
        assert!(s.registry.is_empty());

        let mut buf = Vec::new();
        a.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
