//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a dispatcher's delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages accepted into a mailbox.
    pub posted: u64,
    /// Messages handed to a receiver.
    pub delivered: u64,
    /// Messages dropped because the key was unknown, stopped or closed.
    pub dropped: u64,
    /// Receiver calls (including lifecycle hooks) that errored or panicked.
    pub failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    posted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    pub(crate) fn posted(&self) {
        self.posted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            posted: self.posted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
