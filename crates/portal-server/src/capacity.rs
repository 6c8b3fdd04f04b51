//! Host admission limit.
//!
//! [`HostLimiter`] counts live host sessions; each admitted host holds a
//! [`HostGuard`] for the lifetime of its session task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct HostLimiter {
    max_hosts: usize,
    active: Arc<AtomicUsize>,
}

impl HostLimiter {
    pub fn new(max_hosts: usize) -> Self {
        Self {
            max_hosts,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Admit one more host, or `None` when the broker is full.
    pub fn try_acquire(&self) -> Option<HostGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_hosts).then_some(n + 1)
            })
            .ok()
            .map(|_| HostGuard {
                counter: self.active.clone(),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_hosts(&self) -> usize {
        self.max_hosts
    }
}

/// Decrements the host count on drop. `Send`, so it moves into the session task.
pub struct HostGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
