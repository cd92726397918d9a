//! Health checker — periodic parallel probing of the fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use gridlb_core::{FleetRegistry, HealthCheckConfig, Worker, WorkerId};

use crate::probe::{LivenessProbe, ProbeResult};

/// Callback invoked when a worker returns to `Available`.
///
/// The balancer uses this to retry its overflow queue.
pub type RecoveryCallback = Arc<dyn Fn(WorkerId) -> BoxFuture + Send + Sync>;

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Outcome of one probing round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub probed: usize,
    /// Workers flipped `Unhealthy → Available`.
    pub recovered: Vec<WorkerId>,
    /// Workers flipped `Available → Unhealthy`.
    pub marked_unhealthy: Vec<WorkerId>,
}

pub struct HealthChecker {
    registry: FleetRegistry,
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
    timeout: Duration,
    on_recovery: Option<RecoveryCallback>,
}

impl HealthChecker {
    pub fn new(registry: FleetRegistry, probe: Arc<dyn LivenessProbe>, config: &HealthCheckConfig) -> Self {
        Self {
            registry,
            probe,
            interval: config.interval,
            timeout: config.timeout,
            on_recovery: None,
        }
    }

    pub fn with_callback(mut self, callback: RecoveryCallback) -> Self {
        self.on_recovery = Some(callback);
        self
    }

    /// Probe every non-draining worker concurrently and apply the results.
    pub async fn check_all(&self) -> CheckReport {
        let mut probes = JoinSet::new();
        for worker in self.registry.workers() {
            if worker.is_draining() {
                continue;
            }
            let probe = Arc::clone(&self.probe);
            let timeout = self.timeout;
            probes.spawn(async move {
                let result = tokio::time::timeout(timeout, probe.probe(&worker))
                    .await
                    .unwrap_or(ProbeResult::Failed);
                (worker, result)
            });
        }

        let mut report = CheckReport::default();
        while let Some(joined) = probes.join_next().await {
            let (worker, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "liveness probe task failed");
                    continue;
                }
            };
            report.probed += 1;
            self.apply(&worker, result, &mut report).await;
        }

        report.recovered.sort();
        report.marked_unhealthy.sort();
        report
    }

    async fn apply(&self, worker: &Worker, result: ProbeResult, report: &mut CheckReport) {
        let id = worker.id().to_string();
        if result.is_healthy() {
            if worker.mark_available() {
                info!(worker_id = %id, "worker recovered");
                report.recovered.push(id.clone());
                if let Some(ref cb) = self.on_recovery {
                    cb(id).await;
                }
            }
        } else if worker.mark_unhealthy() {
            warn!(worker_id = %id, ?result, "worker failed liveness probe");
            report.marked_unhealthy.push(id);
        } else {
            debug!(worker_id = %id, ?result, "probe failed, worker already out of rotation");
        }
    }

    /// Probe the fleet every interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "health checker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.check_all().await;
                    debug!(
                        probed = report.probed,
                        recovered = report.recovered.len(),
                        unhealthy = report.marked_unhealthy.len(),
                        "health check round complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }
}
