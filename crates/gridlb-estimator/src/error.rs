//! Estimator and measurement-store error types.

use thiserror::Error;

/// Result type alias for estimation.
pub type EstimatorResult<T> = Result<T, EstimatorError>;

/// Result type alias for measurement store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that reject a request at estimation time. None of these are retried.
#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("unsupported workload: {0}")]
    UnsupportedWorkload(String),

    #[error("invalid parameter {param:?} for workload {workload}: {reason}")]
    InvalidParameter {
        workload: String,
        param: String,
        reason: String,
    },

    #[error("calibration table error: {0}")]
    Calibration(String),

    #[error("measurement store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the durable measurement store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
