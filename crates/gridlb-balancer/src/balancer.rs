//! Load balancer — admission, forwarding, and overflow routing.
//!
//! `dispatch` estimates a request's cost, ranks workers with the
//! configured strategy, and walks the ranking until one worker accepts an
//! atomic reservation. The forward runs on its own task holding an
//! `Admission`; dropping it on any completion path releases the worker's
//! load and wakes the queue pump.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use gridlb_core::{
    BalancerConfig, ExecutionStats, FailurePolicy, FleetRegistry, RemovalStatus, Reservation,
    WakeSignal, Worker, WorkerId, WorkerResponse, WorkerSnapshot, WorkloadRequest,
};
use gridlb_estimator::{ComplexityEstimate, ComplexityEstimator};
use gridlb_placement::{AdaptiveStrategy, VmSelectionStrategy};

use crate::collaborator::{Forwarder, ServerlessInvoker};
use crate::error::{CollaboratorError, DispatchError, DispatchResult};
use crate::metrics::{BalancerMetrics, MetricsSnapshot};
use crate::queue::{OverflowQueue, QueuedRequest, Responder};

/// Where a dispatched request went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Worker(WorkerId),
    Serverless,
    Queued,
}

/// Handle to an accepted request.
#[derive(Debug)]
pub struct Dispatched {
    pub route: Route,
    pub estimate: ComplexityEstimate,
    response: oneshot::Receiver<DispatchResult<WorkerResponse>>,
}

impl Dispatched {
    /// Wait for the request to finish, wherever it was routed.
    pub async fn response(self) -> DispatchResult<WorkerResponse> {
        self.response
            .await
            .unwrap_or_else(|_| Err(DispatchError::Cancelled))
    }
}

/// A reservation that also wakes the queue pump once released.
struct Admission {
    worker: Arc<Worker>,
    reservation: Option<Reservation>,
    freed: Arc<Notify>,
}

impl Admission {
    fn new(reservation: Reservation, freed: Arc<Notify>) -> Self {
        Self {
            worker: Arc::clone(reservation.worker()),
            reservation: Some(reservation),
            freed,
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        // Release before waking so the pump sees the freed headroom.
        self.reservation.take();
        self.freed.notify_one();
    }
}

struct Shared {
    registry: FleetRegistry,
    estimator: Arc<ComplexityEstimator>,
    strategy: Arc<dyn VmSelectionStrategy>,
    forwarder: Arc<dyn Forwarder>,
    serverless: Option<Arc<dyn ServerlessInvoker>>,
    config: BalancerConfig,
    queue: OverflowQueue,
    metrics: BalancerMetrics,
    capacity_freed: Arc<Notify>,
    autoscaler_wake: WakeSignal,
    /// Serializes queue draining so admissible entries are never admitted out of order.
    drain_lock: Mutex<()>,
}

/// Builder for `LoadBalancer`.
pub struct LoadBalancerBuilder {
    registry: FleetRegistry,
    estimator: Arc<ComplexityEstimator>,
    forwarder: Arc<dyn Forwarder>,
    config: BalancerConfig,
    strategy: Option<Arc<dyn VmSelectionStrategy>>,
    serverless: Option<Arc<dyn ServerlessInvoker>>,
    wake: WakeSignal,
}

impl LoadBalancerBuilder {
    pub fn config(mut self, config: BalancerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the adaptive strategy derived from the config thresholds.
    pub fn strategy(mut self, strategy: Arc<dyn VmSelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Serverless path for cheap requests that find no worker headroom.
    /// Without one, every unplaceable request is queued.
    pub fn serverless(mut self, invoker: Arc<dyn ServerlessInvoker>) -> Self {
        self.serverless = Some(invoker);
        self
    }

    /// Signal notified whenever a request is queued.
    pub fn wake_signal(mut self, wake: WakeSignal) -> Self {
        self.wake = wake;
        self
    }

    pub fn build(self) -> LoadBalancer {
        let strategy = self.strategy.unwrap_or_else(|| {
            Arc::new(AdaptiveStrategy::new(
                self.config.spread_threshold,
                self.config.pack_threshold,
            ))
        });
        LoadBalancer {
            shared: Arc::new(Shared {
                registry: self.registry,
                estimator: self.estimator,
                strategy,
                forwarder: self.forwarder,
                serverless: self.serverless,
                config: self.config,
                queue: OverflowQueue::new(),
                metrics: BalancerMetrics::new(),
                capacity_freed: Arc::new(Notify::new()),
                autoscaler_wake: self.wake,
                drain_lock: Mutex::new(()),
            }),
        }
    }
}

/// Cheaply clonable handle; all clones share one fleet, queue and metrics.
#[derive(Clone)]
pub struct LoadBalancer {
    shared: Arc<Shared>,
}

impl LoadBalancer {
    pub fn builder(
        registry: FleetRegistry,
        estimator: Arc<ComplexityEstimator>,
        forwarder: Arc<dyn Forwarder>,
    ) -> LoadBalancerBuilder {
        LoadBalancerBuilder {
            registry,
            estimator,
            forwarder,
            config: BalancerConfig::default(),
            strategy: None,
            serverless: None,
            wake: WakeSignal::new(),
        }
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.shared.registry
    }

    pub fn estimator(&self) -> &Arc<ComplexityEstimator> {
        &self.shared.estimator
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.shared.config
    }

    /// The signal notified on enqueue, for the autoscaler to wait on.
    pub fn wake_signal(&self) -> WakeSignal {
        self.shared.autoscaler_wake.clone()
    }

    /// Route a request to a worker, the serverless path, or the queue.
    ///
    /// Errors returned here are immediate (estimation failed). Failures
    /// after routing arrive through `Dispatched::response`.
    pub async fn dispatch(&self, request: WorkloadRequest) -> DispatchResult<Dispatched> {
        let shared = &self.shared;
        shared.metrics.record_dispatch();

        let estimate = shared
            .estimator
            .estimate(&request.workload, &request.params)
            .await?;
        let complexity = estimate.value;
        let (tx, rx) = oneshot::channel();

        if let Some((admission, remaining)) = shared.place(complexity) {
            let worker_id = admission.worker.id().to_string();
            debug!(
                %worker_id,
                workload = %request.workload,
                complexity,
                "request admitted"
            );
            shared.spawn_forward(request, estimate, admission, remaining, tx);
            return Ok(Dispatched {
                route: Route::Worker(worker_id),
                estimate,
                response: rx,
            });
        }

        if complexity < shared.config.serverless_threshold
            && let Some(invoker) = &shared.serverless
        {
            debug!(workload = %request.workload, complexity, "no worker headroom, using serverless");
            shared.metrics.record_serverless();
            shared.spawn_serverless(Arc::clone(invoker), request, tx);
            return Ok(Dispatched {
                route: Route::Serverless,
                estimate,
                response: rx,
            });
        }

        let workload = request.workload.clone();
        let depth = shared.queue.push(QueuedRequest::new(request, estimate, tx));
        shared.metrics.record_queued();
        info!(%workload, complexity, queue_len = depth, "no capacity, request queued");
        shared.autoscaler_wake.notify();
        // Capacity freed between the placement attempt and the push would
        // otherwise wait for the next sweep.
        shared.capacity_freed.notify_one();

        Ok(Dispatched {
            route: Route::Queued,
            estimate,
            response: rx,
        })
    }

    /// Wake the queue pump, e.g. after a worker recovers.
    pub fn notify_capacity(&self) {
        self.shared.capacity_freed.notify_one();
    }

    /// Expire stale entries and admit as many queued requests as fit, in
    /// order. Entries no registered worker could ever hold are passed over.
    /// Returns the number admitted.
    pub fn drain_queue(&self) -> usize {
        self.shared.drain_queue()
    }

    /// Drain the overflow queue whenever capacity frees up, and on a fixed
    /// sweep so timeouts fire even on an idle fleet.
    pub async fn run_queue_pump(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.shared.config.queue_sweep_interval.max(Duration::from_millis(1));
        info!(sweep_ms = period.as_millis() as u64, "queue pump started");

        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shared.capacity_freed.notified() => {}
                _ = sweep.tick() => {}
                _ = shutdown.changed() => {
                    info!("queue pump shutting down");
                    break;
                }
            }
            if !self.shared.queue.is_empty() {
                self.shared.drain_queue();
            }
        }

        while let Some(entry) = self.shared.queue.pop_front() {
            entry.respond(Err(DispatchError::Cancelled));
        }
    }

    // ── Worker lifecycle ──────────────────────────────────────────

    /// Register a worker with the configured default capacity.
    pub fn add_worker(&self, id: impl Into<WorkerId>, host: impl Into<String>, port: u16) -> Arc<Worker> {
        let capacity = self.shared.config.worker_capacity;
        self.add_worker_with_capacity(id, host, port, capacity)
    }

    pub fn add_worker_with_capacity(
        &self,
        id: impl Into<WorkerId>,
        host: impl Into<String>,
        port: u16,
        capacity: u64,
    ) -> Arc<Worker> {
        let worker = self.shared.registry.insert(Worker::new(id, host, port, capacity));
        self.shared.capacity_freed.notify_one();
        worker
    }

    /// Stop admitting new load on `id`. Returns whether the worker is now
    /// draining; repeated calls are harmless.
    pub fn initiate_removal(&self, id: &str) -> bool {
        let Some(worker) = self.shared.registry.get(id) else {
            warn!(worker_id = %id, "removal requested for unknown worker");
            return false;
        };
        if worker.mark_draining() {
            info!(worker_id = %id, load = worker.load(), "worker draining");
        }
        worker.is_draining()
    }

    /// Deregister `id` once it has drained to zero load.
    pub fn finalize_removal(&self, id: &str) -> RemovalStatus {
        self.shared.registry.remove_if_drained(id)
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn active_worker_count(&self) -> usize {
        self.shared.registry.active_count()
    }

    pub fn draining_workers(&self) -> Vec<WorkerId> {
        self.shared.registry.draining()
    }

    pub fn least_loaded_worker(&self) -> Option<Arc<Worker>> {
        self.shared.registry.least_loaded()
    }

    pub fn average_load(&self) -> u64 {
        self.shared.registry.average_load()
    }

    pub fn average_utilization(&self) -> f64 {
        self.shared.registry.average_utilization()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Shared {
    /// Reserve capacity on the best-ranked worker that accepts it.
    /// Returns the admission and the untried candidates.
    fn place(&self, complexity: u64) -> Option<(Admission, VecDeque<WorkerId>)> {
        let snapshot = self.registry.snapshot();
        let average = mean_utilization(&snapshot);
        let mut candidates: VecDeque<WorkerId> = self
            .strategy
            .select_candidates(&snapshot, complexity, average)
            .into();
        let admission = self.reserve_next(&mut candidates, complexity)?;
        Some((admission, candidates))
    }

    fn reserve_next(&self, candidates: &mut VecDeque<WorkerId>, complexity: u64) -> Option<Admission> {
        while let Some(id) = candidates.pop_front() {
            // Vanished since the snapshot.
            let Some(worker) = self.registry.get(&id) else {
                continue;
            };
            if let Some(reservation) = worker.reserve(complexity) {
                return Some(Admission::new(reservation, Arc::clone(&self.capacity_freed)));
            }
        }
        None
    }

    fn spawn_forward(
        self: &Arc<Self>,
        request: WorkloadRequest,
        estimate: ComplexityEstimate,
        admission: Admission,
        remaining: VecDeque<WorkerId>,
        responder: Responder,
    ) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = shared.forward(&request, estimate, admission, remaining).await;
            let stats = match &result {
                Ok(response) if estimate.freshly_approximated => response.stats,
                _ => None,
            };
            let _ = responder.send(result);
            if let Some(stats) = stats {
                shared.record_measurement(&request, &stats).await;
            }
        });
    }

    async fn forward(
        &self,
        request: &WorkloadRequest,
        estimate: ComplexityEstimate,
        mut admission: Admission,
        mut remaining: VecDeque<WorkerId>,
    ) -> DispatchResult<WorkerResponse> {
        loop {
            let worker = Arc::clone(&admission.worker);
            let outcome = self
                .forward_once(&worker, request, estimate.freshly_approximated)
                .await;
            drop(admission);

            let source = match outcome {
                Ok(response) => {
                    self.metrics.record_forwarded();
                    return Ok(response);
                }
                Err(source) if !source.is_upstream_fault() => {
                    debug!(worker_id = %worker.id(), error = %source, "request rejected before sending");
                    return Err(DispatchError::Forward {
                        worker_id: worker.id().to_string(),
                        source,
                    });
                }
                Err(source) => source,
            };

            self.metrics.record_forward_failure();
            if worker.mark_unhealthy() {
                warn!(worker_id = %worker.id(), error = %source, "forward failed, worker marked unhealthy");
            } else {
                warn!(worker_id = %worker.id(), error = %source, "forward failed");
            }

            if self.config.failure_policy == FailurePolicy::NextCandidate
                && let Some(next) = self.reserve_next(&mut remaining, estimate.value)
            {
                debug!(
                    from = %worker.id(),
                    to = %next.worker.id(),
                    "retrying on next candidate"
                );
                admission = next;
                continue;
            }

            return Err(DispatchError::Forward {
                worker_id: worker.id().to_string(),
                source,
            });
        }
    }

    async fn forward_once(
        &self,
        worker: &Worker,
        request: &WorkloadRequest,
        capture_metrics: bool,
    ) -> Result<WorkerResponse, CollaboratorError> {
        let timeout = self.config.forward_timeout;
        let response = tokio::time::timeout(
            timeout,
            self.forwarder.forward(worker, request, capture_metrics),
        )
        .await
        .map_err(|_| CollaboratorError::Timeout(timeout))??;

        if !response.is_success() {
            return Err(CollaboratorError::Status(response.status));
        }
        Ok(response)
    }

    fn spawn_serverless(
        &self,
        invoker: Arc<dyn ServerlessInvoker>,
        request: WorkloadRequest,
        responder: Responder,
    ) {
        let timeout = self.config.serverless_timeout;
        tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(timeout, invoker.invoke(&request.workload, &request.params)).await;
            let result = match outcome {
                Ok(Ok(response)) if response.is_success() => Ok(response),
                Ok(Ok(response)) => Err(CollaboratorError::Status(response.status)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CollaboratorError::Timeout(timeout)),
            };
            if let Err(e) = &result {
                warn!(workload = %request.workload, error = %e, "serverless invocation failed");
            }
            let _ = responder.send(result.map_err(DispatchError::Serverless));
        });
    }

    async fn record_measurement(&self, request: &WorkloadRequest, stats: &ExecutionStats) {
        match self
            .estimator
            .record_measurement(&request.workload, &request.params, stats)
            .await
        {
            Ok(complexity) => {
                self.metrics.record_measurement();
                debug!(workload = %request.workload, complexity, "execution measured");
            }
            Err(e) => {
                warn!(workload = %request.workload, error = %e, "failed to record measurement");
            }
        }
    }

    fn drain_queue(self: &Arc<Self>) -> usize {
        let Some(_guard) = self.drain_lock.try_lock() else {
            return 0;
        };

        let now = Instant::now();
        let eviction = self.queue.evict_stale(now, self.config.queue_timeout);
        if eviction.abandoned > 0 {
            debug!(count = eviction.abandoned, "discarded abandoned queued requests");
        }
        for entry in eviction.expired {
            let waited = entry.waited(now);
            self.metrics.record_queue_timeout();
            warn!(
                workload = %entry.request.workload,
                complexity = entry.complexity(),
                waited_ms = waited.as_millis() as u64,
                "queued request timed out"
            );
            entry.respond(Err(DispatchError::QueueTimeout { waited }));
        }

        // Entries larger than every worker stay queued for a bigger worker
        // (or their timeout) without holding up the entries behind them.
        let largest = self.registry.largest_capacity();
        let mut oversized = Vec::new();
        let mut admitted = 0;
        while let Some(entry) = self.queue.pop_front() {
            if entry.is_abandoned() {
                continue;
            }
            if largest.is_none_or(|capacity| entry.complexity() > capacity) {
                oversized.push(entry);
                continue;
            }
            let Some((admission, remaining)) = self.place(entry.complexity()) else {
                // FIFO among admissible entries: later ones wait behind the head.
                self.queue.push_front(entry);
                break;
            };
            let waited = entry.waited(Instant::now());
            let (request, estimate, responder) = entry.into_parts();
            self.metrics.record_dequeued();
            info!(
                worker_id = %admission.worker.id(),
                workload = %request.workload,
                complexity = estimate.value,
                waited_ms = waited.as_millis() as u64,
                "queued request admitted"
            );
            self.spawn_forward(request, estimate, admission, remaining, responder);
            admitted += 1;
        }
        if !oversized.is_empty() {
            debug!(count = oversized.len(), ?largest, "queued requests exceed every worker's capacity");
        }
        for entry in oversized.into_iter().rev() {
            self.queue.push_front(entry);
        }
        admitted
    }
}

/// Mean utilization over available workers in a snapshot (0 when none).
fn mean_utilization(snapshot: &[WorkerSnapshot]) -> f64 {
    let (total, count) = snapshot
        .iter()
        .filter(|w| w.is_available())
        .fold((0.0, 0usize), |(total, count), w| (total + w.utilization(), count + 1));
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlb_core::WorkerHealth;

    fn snap(id: &str, load: u64, health: WorkerHealth) -> WorkerSnapshot {
        WorkerSnapshot {
            id: id.to_string(),
            capacity: 100,
            load,
            health,
        }
    }

    #[test]
    fn mean_utilization_ignores_unavailable_workers() {
        let fleet = vec![
            snap("w0", 50, WorkerHealth::Available),
            snap("w1", 100, WorkerHealth::Unhealthy),
            snap("w2", 10, WorkerHealth::Available),
        ];
        assert!((mean_utilization(&fleet) - 0.30).abs() < 1e-9);
    }

    #[test]
    fn mean_utilization_of_empty_fleet_is_zero() {
        assert_eq!(mean_utilization(&[]), 0.0);
        assert_eq!(mean_utilization(&[snap("w0", 80, WorkerHealth::Draining)]), 0.0);
    }

    #[tokio::test]
    async fn admission_drop_releases_then_notifies() {
        let worker = Arc::new(Worker::new("w0", "127.0.0.1", 8001, 100));
        let freed = Arc::new(Notify::new());
        let admission = Admission::new(worker.reserve(40).unwrap(), Arc::clone(&freed));
        assert_eq!(worker.load(), 40);

        drop(admission);
        assert_eq!(worker.load(), 0);
        // The stored permit completes immediately.
        tokio::time::timeout(Duration::from_millis(100), freed.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_reports_cancelled() {
        let (tx, rx) = oneshot::channel();
        let dispatched = Dispatched {
            route: Route::Queued,
            estimate: ComplexityEstimate {
                value: 1,
                freshly_approximated: false,
            },
            response: rx,
        };
        drop(tx);
        assert!(matches!(dispatched.response().await, Err(DispatchError::Cancelled)));
    }

    #[test]
    fn route_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Route::Serverless).unwrap(), "\"serverless\"");
        assert_eq!(
            serde_json::to_string(&Route::Worker("w1".into())).unwrap(),
            "{\"worker\":\"w1\"}"
        );
    }
}
