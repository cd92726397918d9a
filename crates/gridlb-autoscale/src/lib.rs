//! gridlb-autoscale — fleet scaling driven by smoothed utilization.
//!
//! Each tick finalizes drained workers, then (outside the cooldown window)
//! compares the fleet's EMA utilization and queue depth against the
//! configured thresholds and takes at most one action.
//!
//! # Scaling Algorithm
//!
//! ```text
//! utilization = mean over available workers of ema(datapoints in window)
//!
//! if (utilization > high or queue_len > 0) and active < max_workers:
//!     create instance, register worker
//! elif utilization < low and queue_len == 0 and active - 1 >= min_workers:
//!     drain least-loaded worker        // terminated once load reaches 0
//! ```
//!
//! A worker with no datapoints contributes nothing; a fleet with no
//! datapoints at all never scales in.

pub mod fleet;
pub mod scaler;

pub use fleet::{FleetApi, InstanceDescriptor};
pub use scaler::{AutoScaler, ScaleAction, ScaleDecision, ema};
