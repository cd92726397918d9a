//! HTTP front door.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/status` | Fleet snapshot, queue depth, dispatch counters |
//! | POST | `/calibration/reload` | Re-read the configured calibration file |
//! | GET | `/{workload}?k=v...` | Dispatch a workload request |

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;
use tracing::{debug, info, warn};

use gridlb_balancer::{CollaboratorError, DispatchError, LoadBalancer, MetricsSnapshot, Route};
use gridlb_core::{WorkerSnapshot, WorkloadRequest};
use gridlb_estimator::EstimatorError;

/// Response header naming where a request was served.
pub const ROUTE_HEADER: &str = "x-gridlb-route";

/// Shared state for handlers.
#[derive(Clone)]
pub struct ApiState {
    pub balancer: LoadBalancer,
    /// Calibration file to re-read on reload; `None` means the built-in table.
    pub calibration_path: Option<PathBuf>,
}

impl ApiState {
    pub fn new(balancer: LoadBalancer) -> Self {
        Self {
            balancer,
            calibration_path: None,
        }
    }

    pub fn with_calibration_path(mut self, path: Option<PathBuf>) -> Self {
        self.calibration_path = path;
        self
    }
}

/// Build the daemon's router over a balancer using the built-in calibration.
pub fn build_router(balancer: LoadBalancer) -> Router {
    router(ApiState::new(balancer))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/calibration/reload", post(reload_calibration))
        .route("/{workload}", get(dispatch))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            error: msg.to_string(),
        }),
    )
        .into_response()
}

/// Fleet status document.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub workers: Vec<WorkerSnapshot>,
    pub active_workers: usize,
    pub queue_len: usize,
    pub average_utilization: f64,
    pub calibration_version: u32,
    pub metrics: MetricsSnapshot,
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> Json<StatusReport> {
    let lb = &state.balancer;
    let mut workers = lb.registry().snapshot();
    workers.sort_by(|a, b| a.id.cmp(&b.id));
    Json(StatusReport {
        workers,
        active_workers: lb.active_worker_count(),
        queue_len: lb.queue_len(),
        average_utilization: lb.average_utilization(),
        calibration_version: lb.estimator().calibration_version(),
        metrics: lb.metrics(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReloadReport {
    pub version: u32,
}

/// POST /calibration/reload
pub async fn reload_calibration(State(state): State<ApiState>) -> Response {
    let Some(path) = state.calibration_path.clone() else {
        return error_response("no calibration file configured", StatusCode::CONFLICT);
    };
    let estimator = state.balancer.estimator();
    match estimator.reload_calibration(&path) {
        Ok(()) => {
            let version = estimator.calibration_version();
            info!(path = %path.display(), version, "calibration reloaded");
            Json(ReloadReport { version }).into_response()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "calibration reload failed");
            error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY)
        }
    }
}

/// GET /{workload}
pub async fn dispatch(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    let request = WorkloadRequest::new(workload, params);
    let dispatched = match state.balancer.dispatch(request).await {
        Ok(d) => d,
        Err(e) => return dispatch_error(&e),
    };

    let route = route_label(&dispatched.route);
    debug!(%route, complexity = dispatched.estimate.value, "request routed");

    match dispatched.response().await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
            let mut resp = (status, response.body).into_response();
            if let Ok(value) = HeaderValue::from_str(&route) {
                resp.headers_mut().insert(ROUTE_HEADER, value);
            }
            resp
        }
        Err(e) => {
            warn!(%route, error = %e, "request failed");
            dispatch_error(&e)
        }
    }
}

fn route_label(route: &Route) -> String {
    match route {
        Route::Worker(id) => format!("worker:{id}"),
        Route::Serverless => "serverless".to_string(),
        Route::Queued => "queued".to_string(),
    }
}

fn dispatch_error(e: &DispatchError) -> Response {
    let status = match e {
        DispatchError::Estimate(EstimatorError::UnsupportedWorkload(_)) => StatusCode::NOT_FOUND,
        DispatchError::Estimate(EstimatorError::InvalidParameter { .. }) => StatusCode::BAD_REQUEST,
        DispatchError::Estimate(_) => StatusCode::INTERNAL_SERVER_ERROR,
        DispatchError::Forward {
            source: CollaboratorError::InvalidRequest(_),
            ..
        } => StatusCode::BAD_REQUEST,
        DispatchError::Forward {
            source: CollaboratorError::Timeout(_),
            ..
        }
        | DispatchError::Serverless(CollaboratorError::Timeout(_))
        | DispatchError::QueueTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::Forward { .. } | DispatchError::Serverless(_) => StatusCode::BAD_GATEWAY,
        DispatchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(&e.to_string(), status)
}
