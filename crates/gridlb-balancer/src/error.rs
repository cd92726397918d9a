//! Balancer error types.

use std::time::Duration;

use thiserror::Error;

use gridlb_core::WorkerId;
use gridlb_estimator::EstimatorError;

/// Failure reported by an external collaborator (worker relay or
/// serverless function).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The outbound request could not be built from the caller's input.
    /// Says nothing about the worker's health.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CollaboratorError {
    /// Whether the failure implicates the upstream rather than the request.
    pub fn is_upstream_fault(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }
}

/// Errors surfaced to the caller of `LoadBalancer::dispatch`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("complexity estimation failed: {0}")]
    Estimate(#[from] EstimatorError),

    #[error("forwarding to worker {worker_id} failed: {source}")]
    Forward {
        worker_id: WorkerId,
        #[source]
        source: CollaboratorError,
    },

    #[error("serverless invocation failed: {0}")]
    Serverless(#[source] CollaboratorError),

    #[error("request expired after waiting {waited:?} in the overflow queue")]
    QueueTimeout { waited: Duration },

    #[error("request was dropped before completion")]
    Cancelled,
}

pub type DispatchResult<T> = Result<T, DispatchError>;
