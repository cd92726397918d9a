//! gridlbd — the gridlb dispatcher daemon.
//!
//! Assembles every gridlb subsystem behind one HTTP front door:
//! - Measurement store (redb) and complexity estimator
//! - Load balancer with the hyper worker relay and serverless client
//! - Overflow queue pump
//! - Autoscaler over a static slot pool
//! - Health checker
//!
//! # Usage
//!
//! ```text
//! gridlbd run --config /etc/gridlb/gridlb.toml --port 8000
//! ```

mod client;

pub mod api;
pub mod daemon;
pub mod fleet;
pub mod forwarder;
pub mod serverless;

pub use api::{ApiState, ROUTE_HEADER, ReloadReport, StatusReport, build_router, router};
pub use daemon::{Subsystems, assemble, run};
pub use fleet::StaticFleet;
pub use forwarder::{CAPTURE_METRICS_HEADER, HttpForwarder};
pub use serverless::HttpServerless;
