//! Autoscaler — EMA-driven scale-out and drain-based scale-in.
//!
//! Reads per-worker utilization from the `FleetApi`, smooths each series
//! with an exponential moving average, and compares the fleet mean (plus
//! the balancer's queue depth) against the configured thresholds. Scale-in
//! never kills a loaded worker: it starts a drain, and a later tick
//! terminates the instance once its load reaches zero.

use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gridlb_balancer::LoadBalancer;
use gridlb_core::{AutoscalerConfig, RemovalStatus, WakeSignal, WorkerId};

use crate::fleet::FleetApi;

/// What the thresholds call for, before any action is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDecision {
    ScaleOut,
    ScaleIn,
    NoChange,
}

/// What a tick actually did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    /// A new worker joined the fleet.
    Added(WorkerId),
    /// A worker started draining.
    Draining(WorkerId),
    Hold,
}

/// Exponential moving average seeded with the first datapoint, with
/// `α = 2 / (n + 1)` for `n` datapoints. `None` for an empty series.
pub fn ema(points: &[f64]) -> Option<f64> {
    let (first, rest) = points.split_first()?;
    let alpha = 2.0 / (points.len() as f64 + 1.0);
    Some(
        rest.iter()
            .fold(*first, |smoothed, point| alpha * point + (1.0 - alpha) * smoothed),
    )
}

pub struct AutoScaler {
    balancer: LoadBalancer,
    fleet: Arc<dyn FleetApi>,
    config: AutoscalerConfig,
    wake: WakeSignal,
    /// Time of the last successful scaling action.
    last_scaled: Option<Instant>,
}

impl AutoScaler {
    /// Create an autoscaler woken early by the balancer's enqueue signal.
    pub fn new(balancer: LoadBalancer, fleet: Arc<dyn FleetApi>, config: AutoscalerConfig) -> Self {
        let wake = balancer.wake_signal();
        Self {
            balancer,
            fleet,
            config,
            wake,
            last_scaled: None,
        }
    }

    /// Apply the thresholds to a utilization signal and queue depth.
    pub fn evaluate(&self, utilization: Option<f64>, queue_len: usize, active: usize) -> ScaleDecision {
        let overloaded = utilization.is_some_and(|u| u > self.config.high_threshold);
        if (overloaded || queue_len > 0) && active < self.config.max_workers {
            return ScaleDecision::ScaleOut;
        }

        let idle = utilization.is_some_and(|u| u < self.config.low_threshold);
        if idle && queue_len == 0 && active > self.config.min_workers {
            return ScaleDecision::ScaleIn;
        }

        ScaleDecision::NoChange
    }

    pub async fn tick(&mut self) -> anyhow::Result<ScaleAction> {
        self.tick_at(Instant::now()).await
    }

    /// One control-loop iteration as of `now`.
    ///
    /// Fleet API failures abort the tick without touching the cooldown
    /// timestamp.
    pub async fn tick_at(&mut self, now: Instant) -> anyhow::Result<ScaleAction> {
        self.finalize_drains().await;

        if let Some(last) = self.last_scaled {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.cooldown {
                debug!(
                    remaining_secs = (self.config.cooldown - elapsed).as_secs(),
                    "autoscaler in cooldown"
                );
                return Ok(ScaleAction::Hold);
            }
        }

        let utilization = self.sample_utilization().await?;
        let queue_len = self.balancer.queue_len();
        let active = self.balancer.active_worker_count();
        let decision = self.evaluate(utilization, queue_len, active);
        debug!(?utilization, queue_len, active, ?decision, "autoscaler evaluated");

        let action = match decision {
            ScaleDecision::NoChange => return Ok(ScaleAction::Hold),
            ScaleDecision::ScaleOut => {
                let instance = self
                    .fleet
                    .create_instance()
                    .await
                    .context("failed to create instance")?;
                self.balancer
                    .add_worker(instance.id.clone(), instance.host, instance.port);
                info!(
                    worker_id = %instance.id,
                    ?utilization,
                    queue_len,
                    active = active + 1,
                    "scaled out"
                );
                ScaleAction::Added(instance.id)
            }
            ScaleDecision::ScaleIn => {
                let Some(worker) = self.balancer.least_loaded_worker() else {
                    return Ok(ScaleAction::Hold);
                };
                let id = worker.id().to_string();
                if !self.balancer.initiate_removal(&id) {
                    return Ok(ScaleAction::Hold);
                }
                info!(worker_id = %id, load = worker.load(), ?utilization, "scaling in, worker draining");
                ScaleAction::Draining(id)
            }
        };

        self.last_scaled = Some(now);
        Ok(action)
    }

    /// Run until `shutdown` flips. Each tick is followed by a wait for the
    /// rest of the poll interval, cut short by the balancer's wake signal.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            cooldown_secs = self.config.cooldown.as_secs(),
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "autoscaler started"
        );

        loop {
            let started = Instant::now();
            if let Err(e) = self.tick_at(started).await {
                warn!(error = %e, "autoscaler tick aborted");
            }

            tokio::select! {
                _ = tokio::time::sleep_until(started + self.config.poll_interval) => {}
                _ = self.wake.notified() => {
                    debug!("autoscaler woken early");
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    /// Terminate draining workers that have reached zero load.
    async fn finalize_drains(&self) {
        for id in self.balancer.draining_workers() {
            let removable = self
                .balancer
                .registry()
                .get(&id)
                .is_some_and(|w| w.is_removable());
            if !removable {
                continue;
            }
            if let Err(e) = self.fleet.terminate_instance(&id).await {
                warn!(worker_id = %id, error = %e, "failed to terminate drained instance");
                continue;
            }
            if self.balancer.finalize_removal(&id) == RemovalStatus::Removed {
                info!(worker_id = %id, "drained worker removed");
            }
        }
    }

    /// Mean EMA utilization over available workers that reported data.
    async fn sample_utilization(&self) -> anyhow::Result<Option<f64>> {
        let ids: Vec<WorkerId> = self
            .balancer
            .registry()
            .available()
            .iter()
            .map(|w| w.id().to_string())
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }

        let series = self
            .fleet
            .fetch_utilization(&ids, self.config.utilization_window)
            .await
            .context("failed to fetch utilization")?;

        let smoothed: Vec<f64> = ids
            .iter()
            .filter_map(|id| series.get(id))
            .filter_map(|points| ema(points))
            .collect();
        if smoothed.is_empty() {
            return Ok(None);
        }
        Ok(Some(smoothed.iter().sum::<f64>() / smoothed.len() as f64))
    }
}
