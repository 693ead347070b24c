//! Per-service connection counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Service-wide counters, cheap to clone into every worker.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    active: AtomicU64,
    total: AtomicU64,
    closed: AtomicU64,
    reset: AtomicU64,
    /// Plaintext bytes handed to TLS
    bytes_to_tls: AtomicU64,
    /// Decrypted bytes written to the plaintext side
    bytes_to_plain: AtomicU64,
    /// Handshakes that resumed a cached session
    sessions_reused: AtomicU64,
}

/// Snapshot of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub active: u64,
    pub total: u64,
    pub closed: u64,
    pub reset: u64,
    pub bytes_to_tls: u64,
    pub bytes_to_plain: u64,
    pub sessions_reused: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection as active until the guard is dropped.
    pub fn open(&self) -> ConnectionGuard {
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        self.inner.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: self.clone(),
        }
    }

    pub fn session_reused(&self) {
        self.inner.sessions_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = &self.inner;
        StatsSnapshot {
            active: inner.active.load(Ordering::Relaxed),
            total: inner.total.load(Ordering::Relaxed),
            closed: inner.closed.load(Ordering::Relaxed),
            reset: inner.reset.load(Ordering::Relaxed),
            bytes_to_tls: inner.bytes_to_tls.load(Ordering::Relaxed),
            bytes_to_plain: inner.bytes_to_plain.load(Ordering::Relaxed),
            sessions_reused: inner.sessions_reused.load(Ordering::Relaxed),
        }
    }
}

/// Keeps one connection counted as active.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: ConnectionStats,
}

impl ConnectionGuard {
    /// Record the outcome and byte totals of the finished connection.
    pub fn record(&self, clean: bool, to_tls: u64, to_plain: u64) {
        let inner = &self.stats.inner;
        if clean {
            inner.closed.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.reset.fetch_add(1, Ordering::Relaxed);
        }
        inner.bytes_to_tls.fetch_add(to_tls, Ordering::Relaxed);
        inner.bytes_to_plain.fetch_add(to_plain, Ordering::Relaxed);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.inner.active.fetch_sub(1, Ordering::Relaxed);
    }
}
