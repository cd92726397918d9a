//! Worker ranking strategies.
//!
//! All strategies exclude workers that are not `Available` and break ties
//! on worker id so the ranking is deterministic for a given snapshot.

use serde::{Deserialize, Serialize};
use tracing::trace;

use gridlb_core::{WorkerId, WorkerSnapshot};

/// Orders candidate workers for a request of a given complexity.
pub trait VmSelectionStrategy: Send + Sync {
    /// Ranked worker ids, best first.
    fn select_candidates(
        &self,
        snapshot: &[WorkerSnapshot],
        requested: u64,
        average_utilization: f64,
    ) -> Vec<WorkerId>;
}

/// Least-loaded first.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadStrategy;

impl VmSelectionStrategy for SpreadStrategy {
    fn select_candidates(
        &self,
        snapshot: &[WorkerSnapshot],
        _requested: u64,
        _average_utilization: f64,
    ) -> Vec<WorkerId> {
        let mut candidates: Vec<&WorkerSnapshot> =
            snapshot.iter().filter(|w| w.is_available()).collect();
        candidates.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)));
        candidates.into_iter().map(|w| w.id.clone()).collect()
    }
}

/// Most-loaded first, among workers with room for the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackStrategy;

impl VmSelectionStrategy for PackStrategy {
    fn select_candidates(
        &self,
        snapshot: &[WorkerSnapshot],
        requested: u64,
        _average_utilization: f64,
    ) -> Vec<WorkerId> {
        let mut candidates: Vec<&WorkerSnapshot> = snapshot
            .iter()
            .filter(|w| w.is_available() && w.headroom() >= requested)
            .collect();
        candidates.sort_by(|a, b| b.load.cmp(&a.load).then_with(|| a.id.cmp(&b.id)));
        candidates.into_iter().map(|w| w.id.clone()).collect()
    }
}

/// Which placement policy is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMode {
    Spread,
    Pack,
}

/// Spread above `spread_threshold`, pack below `pack_threshold`, spread in
/// between.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveStrategy {
    pub spread_threshold: f64,
    pub pack_threshold: f64,
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self {
            spread_threshold: 0.85,
            pack_threshold: 0.25,
        }
    }
}

impl AdaptiveStrategy {
    pub fn new(spread_threshold: f64, pack_threshold: f64) -> Self {
        Self {
            spread_threshold,
            pack_threshold,
        }
    }

    /// Placement mode for a given fleet-wide average utilization.
    pub fn mode_for(&self, average_utilization: f64) -> PlacementMode {
        if average_utilization > self.spread_threshold {
            PlacementMode::Spread
        } else if average_utilization < self.pack_threshold {
            PlacementMode::Pack
        } else {
            PlacementMode::Spread
        }
    }
}

impl VmSelectionStrategy for AdaptiveStrategy {
    fn select_candidates(
        &self,
        snapshot: &[WorkerSnapshot],
        requested: u64,
        average_utilization: f64,
    ) -> Vec<WorkerId> {
        let mode = self.mode_for(average_utilization);
        trace!(?mode, average_utilization, requested, "placement mode selected");
        match mode {
            PlacementMode::Spread => {
                SpreadStrategy.select_candidates(snapshot, requested, average_utilization)
            }
            PlacementMode::Pack => {
                PackStrategy.select_candidates(snapshot, requested, average_utilization)
            }
        }
    }
}
