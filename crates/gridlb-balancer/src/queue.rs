//! Overflow queue for requests no worker could admit.
//!
//! A FIFO behind a short `parking_lot` critical section. Producers never
//! wait on consumers; the balancer's queue pump is the only consumer that
//! admits entries. It admits them in order, passing over entries that no
//! registered worker is large enough to hold.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use gridlb_core::{WorkerResponse, WorkloadRequest};
use gridlb_estimator::ComplexityEstimate;

use crate::error::DispatchResult;

pub(crate) type Responder = oneshot::Sender<DispatchResult<WorkerResponse>>;

/// A request parked until capacity frees up.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: WorkloadRequest,
    pub estimate: ComplexityEstimate,
    pub enqueued_at: Instant,
    responder: Responder,
}

impl QueuedRequest {
    pub(crate) fn new(
        request: WorkloadRequest,
        estimate: ComplexityEstimate,
        responder: Responder,
    ) -> Self {
        Self {
            request,
            estimate,
            enqueued_at: Instant::now(),
            responder,
        }
    }

    pub fn complexity(&self) -> u64 {
        self.estimate.value
    }

    /// Time spent in the queue as of `now`.
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    /// The caller stopped waiting for the result.
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    /// Resolve the caller's completion handle.
    pub(crate) fn respond(self, result: DispatchResult<WorkerResponse>) {
        // A closed receiver means nobody is listening anymore.
        let _ = self.responder.send(result);
    }

    pub(crate) fn into_parts(self) -> (WorkloadRequest, ComplexityEstimate, Responder) {
        (self.request, self.estimate, self.responder)
    }
}

/// Entries removed by `OverflowQueue::evict_stale`.
#[derive(Debug, Default)]
pub struct Eviction {
    /// Waited longer than the queue timeout; the caller is still listening.
    pub expired: Vec<QueuedRequest>,
    /// Callers that dropped their completion handle.
    pub abandoned: usize,
}

#[derive(Debug, Default)]
pub struct OverflowQueue {
    entries: Mutex<VecDeque<QueuedRequest>>,
}

impl OverflowQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail. Returns the new queue length.
    pub fn push(&self, entry: QueuedRequest) -> usize {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        entries.len()
    }

    /// Return an entry to the head after a failed admission attempt.
    pub(crate) fn push_front(&self, entry: QueuedRequest) {
        self.entries.lock().push_front(entry);
    }

    pub fn pop_front(&self) -> Option<QueuedRequest> {
        self.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every entry that has waited at least `max_age` or whose caller
    /// has gone away, keeping the relative order of the rest.
    pub fn evict_stale(&self, now: Instant, max_age: Duration) -> Eviction {
        let mut eviction = Eviction::default();
        let mut entries = self.entries.lock();
        let mut kept = VecDeque::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if entry.is_abandoned() {
                eviction.abandoned += 1;
            } else if entry.waited(now) >= max_age {
                eviction.expired.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        *entries = kept;
        eviction
    }
}
