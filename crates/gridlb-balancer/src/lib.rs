//! gridlb-balancer — request dispatch across the worker fleet.
//!
//! For each request the balancer:
//!
//! - Estimates complexity with the `ComplexityEstimator`
//! - Ranks available workers with a `VmSelectionStrategy`
//! - Reserves capacity on the first worker that accepts it and forwards
//! - Falls back to the serverless path for cheap requests
//! - Parks everything else in the `OverflowQueue` and wakes the autoscaler
//!
//! # Architecture
//!
//! ```text
//! LoadBalancer
//!   ├── FleetRegistry        (shared with autoscaler and health checker)
//!   ├── ComplexityEstimator  (cache → store → regression)
//!   ├── VmSelectionStrategy  (adaptive spread / pack)
//!   ├── Forwarder            (worker relay, bounded timeout)
//!   ├── ServerlessInvoker    (optional overflow path)
//!   └── OverflowQueue        (drained by the queue pump, strict FIFO)
//! ```

pub mod balancer;
pub mod collaborator;
pub mod error;
pub mod metrics;
pub mod queue;

pub use balancer::{Dispatched, LoadBalancer, LoadBalancerBuilder, Route};
pub use collaborator::{Forwarder, ServerlessInvoker};
pub use error::{CollaboratorError, DispatchError, DispatchResult};
pub use metrics::{BalancerMetrics, MetricsSnapshot};
pub use queue::{Eviction, OverflowQueue, QueuedRequest};
