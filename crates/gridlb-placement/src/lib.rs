//! gridlb-placement — VM selection strategies.
//!
//! Ranks candidate workers for a request, best first. Strategies never
//! reserve anything; the balancer walks the ranking and attempts atomic
//! reservations in order.
//!
//! # Components
//!
//! - **`SpreadStrategy`** — least-loaded first, keeps any one worker from saturating
//! - **`PackStrategy`** — most-loaded-with-room first, lets idle workers drain away
//! - **`AdaptiveStrategy`** — picks spread or pack from fleet-wide utilization

pub mod strategy;

pub use strategy::{AdaptiveStrategy, PackStrategy, PlacementMode, SpreadStrategy, VmSelectionStrategy};
