//! Seams to the systems that actually run workloads.

use async_trait::async_trait;

use gridlb_core::{Params, Worker, WorkerResponse, WorkloadRequest};

use crate::error::CollaboratorError;

/// Relays a request to a worker VM.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward `request` to `worker`. With `capture_metrics` set the worker
    /// is asked to return measured `ExecutionStats` alongside the body.
    ///
    /// Any status is returned as-is; the balancer treats non-2xx as a
    /// failure.
    async fn forward(
        &self,
        worker: &Worker,
        request: &WorkloadRequest,
        capture_metrics: bool,
    ) -> Result<WorkerResponse, CollaboratorError>;
}

/// Invokes the serverless function for a workload.
#[async_trait]
pub trait ServerlessInvoker: Send + Sync {
    async fn invoke(&self, workload: &str, params: &Params)
    -> Result<WorkerResponse, CollaboratorError>;
}
