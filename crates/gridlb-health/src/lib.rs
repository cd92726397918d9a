//! gridlb-health — liveness checking for the worker fleet.
//!
//! Every interval the checker probes all non-draining workers in parallel
//! and flips `Available ↔ Unhealthy` only when the probe result disagrees
//! with the worker's current state. Load is never touched.
//!
//! # Architecture
//!
//! ```text
//! HealthChecker
//!   ├── FleetRegistry (shared with balancer and autoscaler)
//!   ├── LivenessProbe → ProbeResult   (HttpProbe: GET {path}, 2xx = healthy)
//!   └── Optional RecoveryCallback     (e.g. wake the balancer's queue pump)
//! ```

pub mod checker;
pub mod probe;

pub use checker::{BoxFuture, CheckReport, HealthChecker, RecoveryCallback};
pub use probe::{HttpProbe, LivenessProbe, ProbeResult, http_probe};
