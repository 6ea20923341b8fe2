//! Stream counters
//!
//! - Counters only, monotonic, reset on process start
//! - Thread-safe and lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for the streaming service.
///
/// Relaxed ordering throughout; readers only need eventually-exact values.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    /// Sockets accepted by the supervisor
    connections_opened: AtomicU64,
    /// Sockets closed, for any reason
    connections_closed: AtomicU64,
    /// Connections closed for a protocol error
    protocol_errors: AtomicU64,
    /// Sync brackets written
    startup_syncs: AtomicU64,
    /// Subscription changes handled without closing the socket
    soft_resets: AtomicU64,
    /// Publisher sets started
    publisher_sets_started: AtomicU64,
    /// Publisher sets that stopped with an error
    publisher_set_failures: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Connection metrics

    pub fn increment_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_startup_syncs(&self) {
        self.startup_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_soft_resets(&self) {
        self.soft_resets.fetch_add(1, Ordering::Relaxed);
    }

    // Publisher set metrics

    pub fn increment_publisher_sets_started(&self) {
        self.publisher_sets_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_publisher_set_failures(&self) {
        self.publisher_set_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections currently open
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            startup_syncs: self.startup_syncs.load(Ordering::Relaxed),
            soft_resets: self.soft_resets.load(Ordering::Relaxed),
            publisher_sets_started: self.publisher_sets_started.load(Ordering::Relaxed),
            publisher_set_failures: self.publisher_set_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub protocol_errors: u64,
    pub startup_syncs: u64,
    pub soft_resets: u64,
    pub publisher_sets_started: u64,
    pub publisher_set_failures: u64,
}
