//! gridlb-estimator — up-front complexity estimation for workload requests.
//!
//! Resolution order:
//!
//! ```text
//! ComplexityEstimator
//!   ├── LruCache (5000 entries, "{workload}|{canonical params}")
//!   ├── MetricsStore (durable measured values; errors degrade to "not found")
//!   └── CalibrationTable (per-workload linear regression fallback)
//! ```
//!
//! Every returned score is multiplied by the workload's normalization
//! factor so measured and approximated values share one unit. Scores that
//! came from the regression carry `freshly_approximated = true`, telling
//! the caller to capture real statistics via `record_measurement`.

pub mod cache;
pub mod calibration;
pub mod error;
pub mod estimator;
pub mod store;
pub mod tables;

pub use cache::LruCache;
pub use calibration::{CalibrationTable, WorkloadModel};
pub use error::{EstimatorError, EstimatorResult, StoreError, StoreResult};
pub use estimator::{ComplexityEstimate, ComplexityEstimator};
pub use store::{Measurement, MeasurementRecord, MetricsStore, RedbMetricsStore};
