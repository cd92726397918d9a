//! Subsystem assembly and the daemon's run loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use gridlb_autoscale::AutoScaler;
use gridlb_balancer::LoadBalancer;
use gridlb_core::{FleetRegistry, GridConfig, WorkerId};
use gridlb_estimator::{ComplexityEstimator, MetricsStore, RedbMetricsStore};
use gridlb_health::{BoxFuture, HealthChecker, HttpProbe, RecoveryCallback};

use crate::api::ApiState;
use crate::fleet::StaticFleet;
use crate::forwarder::HttpForwarder;
use crate::serverless::HttpServerless;

/// Every long-running piece of the dispatcher, wired to one registry.
pub struct Subsystems {
    pub balancer: LoadBalancer,
    pub autoscaler: AutoScaler,
    pub health: HealthChecker,
}

/// Open the measurement store, build the collaborators, and register the
/// initial fleet.
pub fn assemble(config: &GridConfig) -> anyhow::Result<Subsystems> {
    let store: Arc<dyn MetricsStore> = match &config.estimator.store_path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create store directory {}", parent.display()))?;
            }
            let store = RedbMetricsStore::open(path)
                .with_context(|| format!("open measurement store {}", path.display()))?;
            info!(path = ?path, "measurement store opened");
            Arc::new(store)
        }
        None => {
            info!("measurement store in memory; measurements will not survive restart");
            Arc::new(RedbMetricsStore::open_in_memory().context("open in-memory measurement store")?)
        }
    };

    let estimator = Arc::new(
        ComplexityEstimator::from_config(store, &config.estimator).context("load calibration")?,
    );

    let registry = FleetRegistry::new();
    let mut builder = LoadBalancer::builder(registry.clone(), estimator, Arc::new(HttpForwarder::new()))
        .config(config.balancer.clone());
    if let Some(serverless) = &config.serverless {
        info!(endpoint = %serverless.endpoint, "serverless overflow enabled");
        builder = builder.serverless(Arc::new(HttpServerless::new(serverless.endpoint.clone())));
    }
    let balancer = builder.build();

    for spec in &config.workers {
        let capacity = spec.capacity.unwrap_or(config.balancer.worker_capacity);
        balancer.add_worker_with_capacity(spec.id.clone(), spec.host.clone(), spec.port, capacity);
        info!(worker_id = %spec.id, host = %spec.host, port = spec.port, capacity, "worker registered");
    }

    let fleet = StaticFleet::new(registry.clone(), &config.fleet.slots)?;
    let autoscaler = AutoScaler::new(balancer.clone(), Arc::new(fleet), config.autoscaler.clone());

    let pump = balancer.clone();
    let on_recovery: RecoveryCallback = Arc::new(move |_id: WorkerId| {
        let pump = pump.clone();
        Box::pin(async move { pump.notify_capacity() }) as BoxFuture
    });
    let probe = Arc::new(HttpProbe::new(config.health.path.clone(), config.health.timeout));
    let health = HealthChecker::new(registry, probe, &config.health).with_callback(on_recovery);

    Ok(Subsystems {
        balancer,
        autoscaler,
        health,
    })
}

/// Run the dispatcher until Ctrl-C.
pub async fn run(config: GridConfig, port: u16) -> anyhow::Result<()> {
    info!("gridlb daemon starting");

    let Subsystems {
        balancer,
        mut autoscaler,
        health,
    } = assemble(&config)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pump_shutdown = shutdown_rx.clone();
    let autoscale_shutdown = shutdown_rx.clone();
    let health_shutdown = shutdown_rx.clone();

    // ── Background tasks ───────────────────────────────────────

    let pump = balancer.clone();
    let pump_handle = tokio::spawn(async move {
        pump.run_queue_pump(pump_shutdown).await;
    });

    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(autoscale_shutdown).await;
    });

    let health_handle = tokio::spawn(async move {
        health.run(health_shutdown).await;
    });

    // ── Front door ─────────────────────────────────────────────

    let state = ApiState::new(balancer)
        .with_calibration_path(config.estimator.calibration_path.clone());
    let router = crate::api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "front door listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = pump_handle.await;
    let _ = autoscale_handle.await;
    let _ = health_handle.await;

    info!("gridlb daemon stopped");
    Ok(())
}
