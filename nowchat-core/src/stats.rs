//! Link counters shared between the receive context and the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live counters. Updated with relaxed atomics from either context.
#[derive(Debug, Default)]
pub struct LinkCounters {
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
    validation_drops: AtomicU64,
    auth_drops: AtomicU64,
    queue_full_drops: AtomicU64,
    key_busy_drops: AtomicU64,
    stale_drops: AtomicU64,
}

/// Point-in-time copy of [`LinkCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub validation_drops: u64,
    pub auth_drops: u64,
    pub queue_full_drops: u64,
    /// Dropped by the receive context while keys were being installed.
    pub key_busy_drops: u64,
    /// Queued under a key that was replaced or removed before dispatch.
    pub stale_drops: u64,
}

impl LinkCounters {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_drop(&self) {
        self.validation_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_drop(&self) {
        self.auth_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_busy(&self) {
        self.key_busy_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStats {
        LinkStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            validation_drops: self.validation_drops.load(Ordering::Relaxed),
            auth_drops: self.auth_drops.load(Ordering::Relaxed),
            queue_full_drops: self.queue_full_drops.load(Ordering::Relaxed),
            key_busy_drops: self.key_busy_drops.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let c = LinkCounters::shared();
        c.record_sent(250);
        c.record_sent(250);
        c.record_send_failure();
        c.record_received(250);
        c.record_auth_drop();
        c.record_validation_drop();
        c.record_queue_full();
        let s = c.snapshot();
        assert_eq!(s.bytes_sent, 500);
        assert_eq!(s.messages_sent, 2);
        assert_eq!(s.send_failures, 1);
        assert_eq!(s.bytes_received, 250);
        assert_eq!(s.messages_received, 1);
        assert_eq!(s.auth_drops, 1);
        assert_eq!(s.validation_drops, 1);
        assert_eq!(s.queue_full_drops, 1);
    }
}
