//! Process-wide metrics counters.
//!
//! Mirrors `original_source/src/metrics.c`: a handful of atomic counters
//! updated from the single event-loop thread and printable on demand
//! (SIGUSR1, or the management `STATS` command).

use std::sync::atomic::{AtomicU64, Ordering};

/// Server metrics, shared by the core event loop and the management protocol.
#[derive(Debug, Default)]
pub struct Metrics {
    pub historic_connections: AtomicU64,
    pub current_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub auth_success: AtomicU64,
    pub auth_failure: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.historic_connections.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn auth_succeeded(&self) {
        self.auth_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failed(&self) {
        self.auth_failure.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters, in stable key order (used by STATS and SIGUSR1).
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("historic_connections", self.historic_connections.load(Ordering::Relaxed)),
            ("current_connections", self.current_connections.load(Ordering::Relaxed)),
            ("bytes_sent", self.bytes_sent.load(Ordering::Relaxed)),
            ("bytes_received", self.bytes_received.load(Ordering::Relaxed)),
            ("auth_success", self.auth_success.load(Ordering::Relaxed)),
            ("auth_failure", self.auth_failure.load(Ordering::Relaxed)),
        ]
    }
}
