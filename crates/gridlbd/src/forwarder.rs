//! HTTP relay to worker VMs.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use serde::Deserialize;
use tracing::debug;

use gridlb_balancer::{CollaboratorError, Forwarder};
use gridlb_core::{ExecutionStats, Worker, WorkerResponse, WorkloadRequest};

use crate::client;

/// Header asking an instrumented worker to report execution statistics.
pub const CAPTURE_METRICS_HEADER: &str = "x-capture-metrics";

/// Body returned by an instrumented worker when metrics were requested.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentedBody {
    game_result: serde_json::Value,
    complexity_score: ExecutionStats,
}

/// Relays `GET /{workload}?{query}` to the worker's host and port.
///
/// Requests use origin-form targets over a fresh connection per call.
#[derive(Debug, Clone, Default)]
pub struct HttpForwarder;

impl HttpForwarder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        worker: &Worker,
        request: &WorkloadRequest,
        capture_metrics: bool,
    ) -> Result<WorkerResponse, CollaboratorError> {
        let address = worker.address();
        let query = request.query_string();
        let target = if query.is_empty() {
            format!("/{}", request.workload)
        } else {
            format!("/{}?{query}", request.workload)
        };

        let req = http::Request::builder()
            .method("GET")
            .uri(&target)
            .header("host", &address)
            .header(CAPTURE_METRICS_HEADER, if capture_metrics { "true" } else { "false" })
            .body(Full::new(Bytes::new()))
            .map_err(client::build_error)?;

        let (status, body) = client::exchange(&address, req).await?;
        debug!(worker_id = %worker.id(), %target, status, "worker responded");

        let response = WorkerResponse::new(status, body);
        if !capture_metrics || !response.is_success() {
            return Ok(response);
        }
        Ok(split_instrumented(response))
    }
}

/// Separate the workload result from the reported statistics.
///
/// A worker that ignored the capture header answers with a plain body,
/// which is passed through without stats.
fn split_instrumented(response: WorkerResponse) -> WorkerResponse {
    match serde_json::from_slice::<InstrumentedBody>(&response.body) {
        Ok(parsed) => {
            let body = match parsed.game_result {
                serde_json::Value::String(s) => Bytes::from(s),
                other => Bytes::from(other.to_string()),
            };
            WorkerResponse::new(response.status, body).with_stats(parsed.complexity_score)
        }
        Err(e) => {
            debug!(error = %e, "worker response carried no execution statistics");
            response
        }
    }
}
