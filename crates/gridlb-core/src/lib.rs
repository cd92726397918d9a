//! gridlb-core — shared types for the gridlb dispatcher.
//!
//! Holds the pieces every other crate agrees on:
//!
//! - **`worker`** — a compute VM with atomic load accounting and a
//!   three-state health machine (`Available`, `Unhealthy`, `Draining`)
//! - **`registry`** — the concurrent fleet registry (`WorkerId → Worker`)
//! - **`types`** — inbound requests, worker responses, execution stats
//! - **`config`** — TOML configuration with per-section defaults
//! - **`signal`** — best-effort wake-up signal for control loops
//!
//! # Load accounting
//!
//! ```text
//! state word (u64) = [ health: 2 bits | load: 62 bits ]
//!
//! try_reserve(n): CAS  health == Available && load + n <= capacity
//! release(n):     CAS  load -= n            (health bits untouched)
//! mark_*():       CAS  health transition    (load bits untouched)
//! ```
//!
//! Packing both fields into one word makes admission a single
//! compare-and-update and keeps health flips from racing with load.

pub mod config;
pub mod error;
pub mod registry;
pub mod signal;
pub mod types;
pub mod worker;

pub use config::{
    AutoscalerConfig, BalancerConfig, EstimatorConfig, FailurePolicy, FleetConfig, GridConfig,
    HealthCheckConfig, ServerlessConfig, WorkerSpec, parse_duration,
};
pub use error::{ConfigError, ConfigResult};
pub use registry::{FleetRegistry, RemovalStatus};
pub use signal::WakeSignal;
pub use types::*;
pub use worker::{Reservation, Worker, WorkerHealth, WorkerSnapshot};
