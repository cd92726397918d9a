//! Dispatch counters.
//!
//! Lock-free atomics, read as a serializable snapshot for the status
//! endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct BalancerMetrics {
    dispatched: AtomicU64,
    forwarded: AtomicU64,
    serverless: AtomicU64,
    queued: AtomicU64,
    dequeued: AtomicU64,
    queue_timeouts: AtomicU64,
    forward_failures: AtomicU64,
    measurements_recorded: AtomicU64,
}

/// Point-in-time copy of `BalancerMetrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests accepted by `dispatch` (including those that later failed).
    pub dispatched: u64,
    /// Forwards to workers that completed successfully.
    pub forwarded: u64,
    /// Requests routed to the serverless path.
    pub serverless: u64,
    /// Requests parked in the overflow queue.
    pub queued: u64,
    /// Queued requests later admitted to a worker.
    pub dequeued: u64,
    pub queue_timeouts: u64,
    pub forward_failures: u64,
    pub measurements_recorded: u64,
}

impl BalancerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_serverless(&self) {
        self.serverless.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_timeout(&self) {
        self.queue_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_measurement(&self) {
        self.measurements_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            serverless: self.serverless.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            queue_timeouts: self.queue_timeouts.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            measurements_recorded: self.measurements_recorded.load(Ordering::Relaxed),
        }
    }
}
