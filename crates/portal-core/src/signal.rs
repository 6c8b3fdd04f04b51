//! Idempotent close signal shared by a session (or guest link) and its tasks.

use std::sync::Arc;
use tokio::sync::watch;

/// A one-way "closed" flag that tasks can check or await.
///
/// Cloning shares the flag. `close` flips it exactly once; every later call
/// is a no-op.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark as closed. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been closed.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}
