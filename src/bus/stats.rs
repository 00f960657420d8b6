//! Bus counters.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics snapshot of a [`Bus`](super::Bus).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Messages accepted by the broker.
    pub published: usize,
    /// Publish calls that did not reach the broker (no channel, bad input, rejected).
    pub dropped: usize,
    /// Deliveries handled and acknowledged.
    pub handled: usize,
    /// Deliveries that failed decoding or handling and were rejected.
    pub failed: usize,
    /// Successful (re)connections, each with a usable channel.
    pub connections: usize,
}

/// Live counters shared between the bus components.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    published: AtomicUsize,
    dropped: AtomicUsize,
    handled: AtomicUsize,
    failed: AtomicUsize,
    connections: AtomicUsize,
}

impl Counters {
    pub(crate) fn published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connected(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::SeqCst),
        }
    }
}
