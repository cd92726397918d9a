//! Fleet registry — the authoritative `workerId → Worker` map.
//!
//! Backed by a sharded `DashMap`; entries are `Arc<Worker>` so callers can
//! hold a worker across awaits while it is concurrently removed. All
//! aggregate reads (average load, least-loaded worker) are advisory
//! snapshots.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::WorkerId;
use crate::worker::{Worker, WorkerSnapshot};

/// Outcome of a request to physically deregister a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStatus {
    /// The worker still carries load (or is not draining); retry later.
    Pending,
    /// The worker is gone from the registry.
    Removed,
}

/// Shared, cheaply clonable registry of workers.
#[derive(Debug, Clone, Default)]
pub struct FleetRegistry {
    workers: Arc<DashMap<WorkerId, Arc<Worker>>>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any previous entry with the same id.
    pub fn insert(&self, worker: Worker) -> Arc<Worker> {
        let worker = Arc::new(worker);
        let id = worker.id().to_string();
        if self.workers.insert(id.clone(), Arc::clone(&worker)).is_some() {
            debug!(worker_id = %id, "replaced existing worker entry");
        }
        info!(worker_id = %id, capacity = worker.capacity(), "worker registered");
        worker
    }

    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All workers, ordered by id.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let mut all: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Snapshots of every worker, ordered by id.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut snaps: Vec<WorkerSnapshot> =
            self.workers.iter().map(|entry| entry.value().snapshot()).collect();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        snaps
    }

    /// Workers currently accepting reservations.
    pub fn available(&self) -> Vec<Arc<Worker>> {
        self.workers()
            .into_iter()
            .filter(|w| w.is_available())
            .collect()
    }

    /// Workers not scheduled for removal.
    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|e| !e.value().is_draining()).count()
    }

    /// Ids of workers currently draining.
    pub fn draining(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|e| e.value().is_draining())
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Mean absolute load over available workers (0 when none).
    pub fn average_load(&self) -> u64 {
        let available = self.available();
        if available.is_empty() {
            return 0;
        }
        let total: u64 = available.iter().map(|w| w.load()).sum();
        total / available.len() as u64
    }

    /// Mean per-worker utilization over available workers (0.0 when none).
    pub fn average_utilization(&self) -> f64 {
        let available = self.available();
        if available.is_empty() {
            return 0.0;
        }
        let total: f64 = available.iter().map(|w| w.utilization()).sum();
        total / available.len() as f64
    }

    /// The non-draining worker with the lowest load, ties broken by id.
    pub fn least_loaded(&self) -> Option<Arc<Worker>> {
        self.workers()
            .into_iter()
            .filter(|w| !w.is_draining())
            .min_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.id().cmp(b.id())))
    }

    /// Largest capacity among workers not scheduled for removal.
    ///
    /// A request costing more than this cannot be admitted until a bigger
    /// worker joins, however much load is released.
    pub fn largest_capacity(&self) -> Option<u64> {
        self.workers
            .iter()
            .filter(|e| !e.value().is_draining())
            .map(|e| e.value().capacity())
            .max()
    }

    /// Deregister a worker iff it is draining with zero load.
    ///
    /// Unknown ids count as already removed. Draining blocks new
    /// reservations, so the load check cannot be invalidated between the
    /// test and the removal.
    pub fn remove_if_drained(&self, id: &str) -> RemovalStatus {
        if !self.workers.contains_key(id) {
            return RemovalStatus::Removed;
        }
        match self.workers.remove_if(id, |_, w| w.is_removable()) {
            Some(_) => {
                info!(worker_id = %id, "worker deregistered");
                RemovalStatus::Removed
            }
            None if self.workers.contains_key(id) => RemovalStatus::Pending,
            None => RemovalStatus::Removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(loads: &[(&str, u64)]) -> FleetRegistry {
        let registry = FleetRegistry::new();
        for (id, load) in loads {
            let w = registry.insert(Worker::new(*id, "127.0.0.1", 8000, 100));
            assert!(w.try_reserve(*load));
        }
        registry
    }

    #[test]
    fn insert_and_get() {
        let registry = FleetRegistry::new();
        assert!(registry.is_empty());
        registry.insert(Worker::new("w1", "10.0.0.1", 8000, 100));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("w1").unwrap().host(), "10.0.0.1");
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn clones_share_state() {
        let registry = FleetRegistry::new();
        let other = registry.clone();
        registry.insert(Worker::new("w1", "h", 1, 100));
        assert!(other.contains("w1"));
    }

    #[test]
    fn snapshot_is_sorted_by_id() {
        let registry = registry_with(&[("w2", 1), ("w0", 2), ("w1", 3)]);
        let ids: Vec<_> = registry.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["w0", "w1", "w2"]);
    }

    #[test]
    fn averages_ignore_unavailable_workers() {
        let registry = registry_with(&[("w0", 90), ("w1", 90), ("w2", 10)]);
        registry.get("w2").unwrap().mark_unhealthy();

        assert_eq!(registry.average_load(), 90);
        assert!((registry.average_utilization() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn averages_are_zero_without_available_workers() {
        let registry = registry_with(&[("w0", 50)]);
        registry.get("w0").unwrap().mark_unhealthy();
        assert_eq!(registry.average_load(), 0);
        assert_eq!(registry.average_utilization(), 0.0);
    }

    #[test]
    fn least_loaded_breaks_ties_by_id() {
        let registry = registry_with(&[("w2", 5), ("w1", 5), ("w0", 40)]);
        assert_eq!(registry.least_loaded().unwrap().id(), "w1");
    }

    #[test]
    fn least_loaded_skips_draining() {
        let registry = registry_with(&[("w0", 0), ("w1", 10)]);
        registry.get("w0").unwrap().mark_draining();
        assert_eq!(registry.least_loaded().unwrap().id(), "w1");
    }

    #[test]
    fn active_count_and_draining() {
        let registry = registry_with(&[("w0", 0), ("w1", 0), ("w2", 0)]);
        registry.get("w1").unwrap().mark_draining();
        assert_eq!(registry.active_count(), 2);
        assert_eq!(registry.draining(), vec!["w1".to_string()]);
    }

    #[test]
    fn largest_capacity_ignores_draining_workers() {
        let registry = FleetRegistry::new();
        assert_eq!(registry.largest_capacity(), None);

        registry.insert(Worker::new("small", "h", 1, 100));
        let big = registry.insert(Worker::new("big", "h", 2, 1_000));
        big.mark_unhealthy();
        // Unhealthy workers may come back.
        assert_eq!(registry.largest_capacity(), Some(1_000));

        big.mark_draining();
        assert_eq!(registry.largest_capacity(), Some(100));
    }

    #[test]
    fn remove_if_drained_waits_for_load() {
        let registry = registry_with(&[("w0", 30)]);
        let w = registry.get("w0").unwrap();

        // Not draining yet.
        assert_eq!(registry.remove_if_drained("w0"), RemovalStatus::Pending);

        w.mark_draining();
        assert_eq!(registry.remove_if_drained("w0"), RemovalStatus::Pending);

        w.release(30);
        assert_eq!(registry.remove_if_drained("w0"), RemovalStatus::Removed);
        assert!(!registry.contains("w0"));
    }

    #[test]
    fn remove_unknown_is_removed() {
        let registry = FleetRegistry::new();
        assert_eq!(registry.remove_if_drained("ghost"), RemovalStatus::Removed);
    }
}
