//! Cloud provider seam: instance lifecycle and utilization monitoring.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gridlb_core::WorkerId;

/// A freshly launched instance, ready to register as a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: WorkerId,
    pub host: String,
    pub port: u16,
}

#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Launch one instance and wait until it is reachable.
    async fn create_instance(&self) -> anyhow::Result<InstanceDescriptor>;

    async fn terminate_instance(&self, id: &str) -> anyhow::Result<()>;

    /// Utilization datapoints (fractions in `[0, 1]`, oldest first) per
    /// instance over the trailing `window`. Instances without data may be
    /// absent from the map.
    async fn fetch_utilization(
        &self,
        ids: &[WorkerId],
        window: Duration,
    ) -> anyhow::Result<HashMap<WorkerId, Vec<f64>>>;
}
