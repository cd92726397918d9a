//! Worker — one compute VM with atomic load accounting.
//!
//! Health and reserved load share a single `AtomicU64` so that admission
//! (`try_reserve`) checks both in one compare-and-update. Health transitions
//! rewrite only the top two bits and never disturb the load.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::types::WorkerId;

const HEALTH_SHIFT: u32 = 62;
const LOAD_MASK: u64 = (1 << HEALTH_SHIFT) - 1;

/// Health state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Accepting new reservations.
    Available,
    /// Failed a probe or a forward; no new reservations until it recovers.
    Unhealthy,
    /// Scheduled for removal; in-flight load drains, nothing new is admitted.
    Draining,
}

impl WorkerHealth {
    fn bits(self) -> u64 {
        match self {
            WorkerHealth::Available => 0,
            WorkerHealth::Unhealthy => 1,
            WorkerHealth::Draining => 2,
        }
    }

    fn from_word(word: u64) -> Self {
        match word >> HEALTH_SHIFT {
            0 => WorkerHealth::Available,
            1 => WorkerHealth::Unhealthy,
            _ => WorkerHealth::Draining,
        }
    }
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerHealth::Available => "available",
            WorkerHealth::Unhealthy => "unhealthy",
            WorkerHealth::Draining => "draining",
        };
        f.write_str(s)
    }
}

fn with_health(word: u64, health: WorkerHealth) -> u64 {
    (health.bits() << HEALTH_SHIFT) | (word & LOAD_MASK)
}

/// A single compute VM in the fleet.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    host: String,
    port: u16,
    /// Maximum concurrent complexity units.
    capacity: u64,
    /// Packed `[health | load]` state word.
    state: AtomicU64,
}

impl Worker {
    /// Create a new worker with zero load in the `Available` state.
    pub fn new(id: impl Into<WorkerId>, host: impl Into<String>, port: u16, capacity: u64) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            capacity: capacity.min(LOAD_MASK),
            state: AtomicU64::new(with_health(0, WorkerHealth::Available)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` connection address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Currently reserved load. Advisory: may be stale by the time it is used.
    pub fn load(&self) -> u64 {
        self.state.load(Ordering::Acquire) & LOAD_MASK
    }

    pub fn health(&self) -> WorkerHealth {
        WorkerHealth::from_word(self.state.load(Ordering::Acquire))
    }

    /// Free capacity left on this worker.
    pub fn headroom(&self) -> u64 {
        self.capacity.saturating_sub(self.load())
    }

    /// Reserved load as a fraction of capacity (0.0–1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.load() as f64 / self.capacity as f64
    }

    pub fn is_available(&self) -> bool {
        self.health() == WorkerHealth::Available
    }

    pub fn is_unhealthy(&self) -> bool {
        self.health() == WorkerHealth::Unhealthy
    }

    pub fn is_draining(&self) -> bool {
        self.health() == WorkerHealth::Draining
    }

    /// Draining with no load left: safe to deregister.
    pub fn is_removable(&self) -> bool {
        let word = self.state.load(Ordering::Acquire);
        WorkerHealth::from_word(word) == WorkerHealth::Draining && word & LOAD_MASK == 0
    }

    /// Atomically reserve `amount` units.
    ///
    /// Succeeds iff the worker is `Available` and `load + amount <= capacity`.
    /// On failure nothing changes.
    pub fn try_reserve(&self, amount: u64) -> bool {
        let capacity = self.capacity;
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                if WorkerHealth::from_word(word) != WorkerHealth::Available {
                    return None;
                }
                let next = (word & LOAD_MASK).checked_add(amount)?;
                (next <= capacity).then_some((word & !LOAD_MASK) | next)
            })
            .is_ok()
    }

    /// Release `amount` previously reserved units.
    ///
    /// Must be called exactly once per successful `try_reserve`. A release
    /// larger than the current load clamps at zero and is logged.
    pub fn release(&self, amount: u64) {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let load = (word & LOAD_MASK).saturating_sub(amount);
                Some((word & !LOAD_MASK) | load)
            })
            .unwrap_or_else(|word| word);

        if previous & LOAD_MASK < amount {
            error!(
                worker_id = %self.id,
                load = previous & LOAD_MASK,
                amount,
                "release exceeds reserved load"
            );
        }
    }

    /// Reserve `amount` units, returning a guard that releases on drop.
    pub fn reserve(self: &Arc<Self>, amount: u64) -> Option<Reservation> {
        self.try_reserve(amount).then(|| Reservation {
            worker: Arc::clone(self),
            amount,
        })
    }

    /// `Available → Unhealthy`. Returns true if the state changed.
    pub fn mark_unhealthy(&self) -> bool {
        self.transition(&[WorkerHealth::Available], WorkerHealth::Unhealthy)
    }

    /// `Unhealthy → Available`. Returns true if the state changed.
    pub fn mark_available(&self) -> bool {
        self.transition(&[WorkerHealth::Unhealthy], WorkerHealth::Available)
    }

    /// Begin draining. Idempotent and one-way.
    pub fn mark_draining(&self) -> bool {
        self.transition(
            &[WorkerHealth::Available, WorkerHealth::Unhealthy],
            WorkerHealth::Draining,
        )
    }

    fn transition(&self, from: &[WorkerHealth], to: WorkerHealth) -> bool {
        let changed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let current = WorkerHealth::from_word(word);
                from.contains(&current).then(|| with_health(word, to))
            })
            .is_ok();
        if changed {
            debug!(worker_id = %self.id, health = %to, "worker health changed");
        }
        changed
    }

    /// Point-in-time copy of this worker's state for ranking.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let word = self.state.load(Ordering::Acquire);
        WorkerSnapshot {
            id: self.id.clone(),
            capacity: self.capacity,
            load: word & LOAD_MASK,
            health: WorkerHealth::from_word(word),
        }
    }
}

/// A held reservation on a worker. Releases its load exactly once on drop.
#[derive(Debug)]
pub struct Reservation {
    worker: Arc<Worker>,
    amount: u64,
}

impl Reservation {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.worker.release(self.amount);
    }
}

/// Copy of a worker's state at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub capacity: u64,
    pub load: u64,
    pub health: WorkerHealth,
}

impl WorkerSnapshot {
    pub fn headroom(&self) -> u64 {
        self.capacity.saturating_sub(self.load)
    }

    pub fn is_available(&self) -> bool {
        self.health == WorkerHealth::Available
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.load as f64 / self.capacity as f64
    }
}
