//! Dispatch scenarios across admission, serverless overflow and queueing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use gridlb_balancer::{
    CollaboratorError, DispatchError, Forwarder, LoadBalancer, Route, ServerlessInvoker,
};
use gridlb_core::{
    BalancerConfig, ExecutionStats, FailurePolicy, FleetRegistry, Params, RemovalStatus,
    WakeSignal, Worker, WorkerResponse, WorkloadRequest,
};
use gridlb_estimator::{CalibrationTable, ComplexityEstimator, RedbMetricsStore};

/// Approximated complexity equals the `cost` parameter; measured
/// complexity is `ndata_reads + nmethod`.
const CALIBRATION: &str = r#"
    version = 1

    [workloads.job]
    instruction_divisor = 1.0
    instruction_weight = 1.0
    normalization = 1.0

    [workloads.job.instructions]
    intercept = 0.0
    numeric = { cost = 1.0 }

    [workloads.job.methods]
    intercept = 0.0

    [workloads.job.measured]
    reads_divisor = 1.0
    reads_weight = 1.0
"#;

#[derive(Default)]
struct ScriptedForwarder {
    gate: Option<Arc<Semaphore>>,
    failing: HashSet<String>,
    unbuildable: bool,
    hang: bool,
    stats: Option<ExecutionStats>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedForwarder {
    fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        }
    }

    fn failing_on(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1_000);
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forwarder for ScriptedForwarder {
    async fn forward(
        &self,
        worker: &Worker,
        _request: &WorkloadRequest,
        _capture_metrics: bool,
    ) -> Result<WorkerResponse, CollaboratorError> {
        self.calls.lock().unwrap().push(worker.id().to_string());
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if self.unbuildable {
            return Err(CollaboratorError::InvalidRequest("invalid uri character".into()));
        }
        if self.failing.contains(worker.id()) {
            return Err(CollaboratorError::Connect("connection refused".into()));
        }
        let response = WorkerResponse::new(200, format!("ok:{}", worker.id()));
        Ok(match self.stats {
            Some(stats) => response.with_stats(stats),
            None => response,
        })
    }
}

#[derive(Default)]
struct CountingServerless {
    calls: Mutex<usize>,
}

#[async_trait]
impl ServerlessInvoker for CountingServerless {
    async fn invoke(
        &self,
        _workload: &str,
        _params: &Params,
    ) -> Result<WorkerResponse, CollaboratorError> {
        *self.calls.lock().unwrap() += 1;
        Ok(WorkerResponse::new(200, "serverless"))
    }
}

fn estimator() -> Arc<ComplexityEstimator> {
    let store = Arc::new(RedbMetricsStore::open_in_memory().unwrap());
    let table = CalibrationTable::parse(CALIBRATION).unwrap();
    Arc::new(ComplexityEstimator::new(store, table, 100))
}

fn job(cost: u64) -> WorkloadRequest {
    let params: Params = [("cost".to_string(), cost.to_string())].into_iter().collect();
    WorkloadRequest::new("job", params)
}

fn balancer(forwarder: Arc<ScriptedForwarder>, config: BalancerConfig) -> LoadBalancer {
    LoadBalancer::builder(FleetRegistry::new(), estimator(), forwarder)
        .config(config)
        .build()
}

fn spawn_pump(lb: &LoadBalancer) -> watch::Sender<bool> {
    let (tx, rx) = watch::channel(false);
    let pump = lb.clone();
    tokio::spawn(async move { pump.run_queue_pump(rx).await });
    tx
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn saturated_fleet_spreads_onto_lowest_id_tie() {
    let forwarder = Arc::new(ScriptedForwarder::gated());
    let lb = balancer(forwarder.clone(), BalancerConfig::default());
    for id in ["w0", "w1", "w2"] {
        let worker = lb.add_worker_with_capacity(id, "127.0.0.1", 8000, 100);
        assert!(worker.try_reserve(90));
    }

    let dispatched = lb.dispatch(job(5)).await.unwrap();
    assert_eq!(dispatched.route, Route::Worker("w0".into()));
    assert_eq!(lb.registry().get("w0").unwrap().load(), 95);
    assert_eq!(lb.registry().get("w1").unwrap().load(), 90);

    forwarder.open_gate();
    let response = dispatched.response().await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(lb.registry().get("w0").unwrap().load(), 90);
}

#[tokio::test]
async fn cheap_request_overflows_to_serverless() {
    let forwarder = Arc::new(ScriptedForwarder::default());
    let serverless = Arc::new(CountingServerless::default());
    let lb = LoadBalancer::builder(FleetRegistry::new(), estimator(), forwarder)
        .serverless(serverless.clone())
        .build();
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    assert!(worker.try_reserve(100));

    let dispatched = lb.dispatch(job(500_000)).await.unwrap();
    assert_eq!(dispatched.route, Route::Serverless);
    let response = dispatched.response().await.unwrap();
    assert_eq!(&response.body[..], b"serverless");
    assert_eq!(*serverless.calls.lock().unwrap(), 1);
    assert_eq!(lb.metrics().serverless, 1);
    assert_eq!(lb.queue_len(), 0);
}

#[tokio::test]
async fn expensive_request_waits_in_queue_until_a_worker_joins() {
    let forwarder = Arc::new(ScriptedForwarder::default());
    let wake = WakeSignal::new();
    let lb = LoadBalancer::builder(FleetRegistry::new(), estimator(), forwarder.clone())
        .serverless(Arc::new(CountingServerless::default()))
        .wake_signal(wake.clone())
        .build();
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    assert!(worker.try_reserve(100));
    let shutdown = spawn_pump(&lb);

    let dispatched = lb.dispatch(job(1_000_000)).await.unwrap();
    assert_eq!(dispatched.route, Route::Queued);
    assert_eq!(lb.queue_len(), 1);
    tokio::time::timeout(Duration::from_secs(1), wake.notified())
        .await
        .expect("autoscaler should be woken on enqueue");

    lb.add_worker("w1", "127.0.0.1", 8001);
    let response = dispatched.response().await.unwrap();
    assert_eq!(&response.body[..], b"ok:w1");
    assert_eq!(lb.queue_len(), 0);
    assert_eq!(lb.metrics().dequeued, 1);
    assert_eq!(forwarder.calls(), vec!["w1"]);

    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn without_serverless_cheap_requests_queue() {
    let lb = balancer(Arc::new(ScriptedForwarder::default()), BalancerConfig::default());
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    assert!(worker.try_reserve(100));

    let dispatched = lb.dispatch(job(500_000)).await.unwrap();
    assert_eq!(dispatched.route, Route::Queued);
    assert_eq!(lb.metrics().queued, 1);
}

#[tokio::test]
async fn queue_admits_head_first() {
    let lb = balancer(Arc::new(ScriptedForwarder::default()), BalancerConfig::default());
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    assert!(worker.try_reserve(100));

    let first = lb.dispatch(job(80)).await.unwrap();
    let second = lb.dispatch(job(10)).await.unwrap();
    assert_eq!(first.route, Route::Queued);
    assert_eq!(second.route, Route::Queued);

    // 30 units free: the second entry would fit but must wait for the head.
    worker.release(30);
    assert_eq!(lb.drain_queue(), 0);
    assert_eq!(lb.queue_len(), 2);

    worker.release(70);
    assert_eq!(lb.drain_queue(), 2);
    assert_eq!(lb.queue_len(), 0);
    assert!(first.response().await.is_ok());
    assert!(second.response().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn oversized_head_does_not_block_smaller_requests() {
    let lb = balancer(Arc::new(ScriptedForwarder::default()), BalancerConfig::default());
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    assert!(worker.try_reserve(100));
    let _shutdown = spawn_pump(&lb);

    let huge = lb.dispatch(job(1_000)).await.unwrap();
    let small = lb.dispatch(job(10)).await.unwrap();
    assert_eq!(huge.route, Route::Queued);
    assert_eq!(small.route, Route::Queued);

    worker.release(100);
    let response = tokio::time::timeout(Duration::from_secs(5), small.response())
        .await
        .expect("small request should not wait behind an oversized head")
        .unwrap();
    assert_eq!(&response.body[..], b"ok:w0");
    assert_eq!(lb.queue_len(), 1);
    assert_eq!(lb.metrics().dequeued, 1);

    // A big enough worker takes it.
    lb.add_worker_with_capacity("w1", "127.0.0.1", 8001, 5_000);
    let response = huge.response().await.unwrap();
    assert_eq!(&response.body[..], b"ok:w1");
    assert_eq!(lb.queue_len(), 0);
}

#[tokio::test]
async fn oversized_entries_keep_their_place() {
    let lb = balancer(Arc::new(ScriptedForwarder::default()), BalancerConfig::default());
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    assert!(worker.try_reserve(100));

    let huge = lb.dispatch(job(1_000)).await.unwrap();
    let first = lb.dispatch(job(60)).await.unwrap();
    let second = lb.dispatch(job(60)).await.unwrap();

    // Room for one of the two admissible entries; the oversized one is skipped.
    worker.release(100);
    assert_eq!(lb.drain_queue(), 1);
    assert_eq!(lb.queue_len(), 2);
    assert!(first.response().await.is_ok());

    lb.add_worker_with_capacity("w1", "127.0.0.1", 8001, 1_000);
    assert_eq!(lb.drain_queue(), 2);
    assert!(huge.response().await.is_ok());
    assert!(second.response().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn queued_request_times_out() {
    let config = BalancerConfig {
        queue_timeout: Duration::from_secs(5),
        queue_sweep_interval: Duration::from_secs(1),
        ..Default::default()
    };
    let lb = balancer(Arc::new(ScriptedForwarder::default()), config);
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    assert!(worker.try_reserve(100));
    let _shutdown = spawn_pump(&lb);

    let dispatched = lb.dispatch(job(1_000_000)).await.unwrap();
    match dispatched.response().await {
        Err(DispatchError::QueueTimeout { waited }) => assert!(waited >= Duration::from_secs(5)),
        other => panic!("expected queue timeout, got {other:?}"),
    }
    assert_eq!(lb.queue_len(), 0);
    assert_eq!(lb.metrics().queue_timeouts, 1);
}

#[tokio::test]
async fn fail_fast_surfaces_error_and_marks_worker_unhealthy() {
    let lb = balancer(
        Arc::new(ScriptedForwarder::failing_on(&["w0"])),
        BalancerConfig::default(),
    );
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 1_000);

    let dispatched = lb.dispatch(job(10)).await.unwrap();
    assert_eq!(dispatched.route, Route::Worker("w0".into()));
    match dispatched.response().await {
        Err(DispatchError::Forward { worker_id, source }) => {
            assert_eq!(worker_id, "w0");
            assert!(matches!(source, CollaboratorError::Connect(_)));
        }
        other => panic!("expected forward failure, got {other:?}"),
    }
    assert!(worker.is_unhealthy());
    assert_eq!(worker.load(), 0);
    assert_eq!(lb.metrics().forward_failures, 1);
}

#[tokio::test]
async fn unbuildable_request_leaves_worker_healthy() {
    let forwarder = Arc::new(ScriptedForwarder {
        unbuildable: true,
        ..Default::default()
    });
    let config = BalancerConfig {
        failure_policy: FailurePolicy::NextCandidate,
        ..Default::default()
    };
    let lb = balancer(forwarder.clone(), config);
    let w0 = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 1_000);
    let w1 = lb.add_worker_with_capacity("w1", "127.0.0.1", 8001, 1_000);

    let dispatched = lb.dispatch(job(10)).await.unwrap();
    match dispatched.response().await {
        Err(DispatchError::Forward { source, .. }) => {
            assert!(matches!(source, CollaboratorError::InvalidRequest(_)));
        }
        other => panic!("expected request error, got {other:?}"),
    }
    // Not retried elsewhere, nobody marked down.
    assert_eq!(forwarder.calls().len(), 1);
    assert!(w0.is_available());
    assert!(w1.is_available());
    assert_eq!(w0.load() + w1.load(), 0);
    assert_eq!(lb.metrics().forward_failures, 0);
}

#[tokio::test]
async fn next_candidate_policy_retries_remaining_workers() {
    let forwarder = Arc::new(ScriptedForwarder::failing_on(&["w0"]));
    let config = BalancerConfig {
        failure_policy: FailurePolicy::NextCandidate,
        ..Default::default()
    };
    let lb = balancer(forwarder.clone(), config);
    let w0 = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 1_000);
    let w1 = lb.add_worker_with_capacity("w1", "127.0.0.1", 8001, 1_000);

    let dispatched = lb.dispatch(job(10)).await.unwrap();
    let response = dispatched.response().await.unwrap();
    assert_eq!(&response.body[..], b"ok:w1");
    assert_eq!(forwarder.calls(), vec!["w0", "w1"]);
    assert!(w0.is_unhealthy());
    assert!(w1.is_available());
    assert_eq!(w0.load() + w1.load(), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_forward_times_out_and_releases() {
    let forwarder = Arc::new(ScriptedForwarder {
        hang: true,
        ..Default::default()
    });
    let config = BalancerConfig {
        forward_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let lb = balancer(forwarder, config);
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 1_000);

    let dispatched = lb.dispatch(job(10)).await.unwrap();
    assert_eq!(worker.load(), 10);
    match dispatched.response().await {
        Err(DispatchError::Forward { source, .. }) => {
            assert_eq!(source, CollaboratorError::Timeout(Duration::from_secs(2)));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(worker.load(), 0);
}

#[tokio::test]
async fn unknown_workload_fails_before_routing() {
    let lb = balancer(Arc::new(ScriptedForwarder::default()), BalancerConfig::default());
    let worker = lb.add_worker("w0", "127.0.0.1", 8000);

    let err = lb
        .dispatch(WorkloadRequest::new("sudoku", Params::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Estimate(_)));
    assert_eq!(worker.load(), 0);
    assert_eq!(lb.queue_len(), 0);
}

#[tokio::test]
async fn measured_stats_replace_the_approximation() {
    let forwarder = Arc::new(ScriptedForwarder {
        stats: Some(ExecutionStats {
            nmethod: 7,
            ndata_reads: 3,
            ..Default::default()
        }),
        ..Default::default()
    });
    let lb = balancer(forwarder, BalancerConfig::default());
    lb.add_worker("w0", "127.0.0.1", 8000);

    let dispatched = lb.dispatch(job(40)).await.unwrap();
    assert!(dispatched.estimate.freshly_approximated);
    assert_eq!(dispatched.estimate.value, 40);
    dispatched.response().await.unwrap();

    wait_for(|| lb.metrics().measurements_recorded == 1).await;
    let estimate = lb.estimator().estimate("job", &job(40).params).await.unwrap();
    assert_eq!(estimate.value, 10);
    assert!(!estimate.freshly_approximated);
}

#[tokio::test]
async fn removal_waits_for_in_flight_load() {
    let lb = balancer(Arc::new(ScriptedForwarder::default()), BalancerConfig::default());
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);
    lb.add_worker_with_capacity("w1", "127.0.0.1", 8001, 100);
    let in_flight = worker.reserve(10).unwrap();

    assert!(lb.initiate_removal("w0"));
    assert!(lb.initiate_removal("w0"));
    assert_eq!(lb.active_worker_count(), 1);
    assert_eq!(lb.draining_workers(), vec!["w0"]);
    assert_eq!(lb.finalize_removal("w0"), RemovalStatus::Pending);

    // Draining workers take no new load.
    let dispatched = lb.dispatch(job(5)).await.unwrap();
    assert_eq!(dispatched.route, Route::Worker("w1".into()));

    drop(in_flight);
    assert_eq!(lb.finalize_removal("w0"), RemovalStatus::Removed);
    assert!(!lb.registry().contains("w0"));

    assert!(!lb.initiate_removal("ghost"));
    assert_eq!(lb.finalize_removal("ghost"), RemovalStatus::Removed);
}

#[tokio::test]
async fn concurrent_dispatch_never_exceeds_capacity() {
    let forwarder = Arc::new(ScriptedForwarder::gated());
    let lb = balancer(forwarder.clone(), BalancerConfig::default());
    let worker = lb.add_worker_with_capacity("w0", "127.0.0.1", 8000, 100);

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let lb = lb.clone();
        tasks.spawn(async move { lb.dispatch(job(10)).await.unwrap() });
    }
    let mut handles = Vec::new();
    while let Some(result) = tasks.join_next().await {
        handles.push(result.unwrap());
    }

    let admitted = handles
        .iter()
        .filter(|d| matches!(d.route, Route::Worker(_)))
        .count();
    assert_eq!(admitted, 10);
    assert_eq!(worker.load(), 100);
    assert_eq!(lb.queue_len(), 40);

    let _shutdown = spawn_pump(&lb);
    forwarder.open_gate();
    for dispatched in handles {
        assert!(dispatched.response().await.is_ok());
    }
    assert_eq!(worker.load(), 0);
    assert_eq!(lb.metrics().dequeued, 40);
}
