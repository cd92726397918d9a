//! Fixed-pool fleet: scale-out hands out pre-provisioned worker slots.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use gridlb_autoscale::{FleetApi, InstanceDescriptor};
use gridlb_core::{FleetRegistry, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    host: String,
    port: u16,
}

#[derive(Debug, Default)]
struct Pool {
    free: VecDeque<Slot>,
    leased: HashMap<WorkerId, Slot>,
    next_id: u64,
}

/// A `FleetApi` over a static list of `host:port` slots.
///
/// Utilization is read from the registry's reserved-load ratio, one
/// datapoint per call, so the autoscaler's EMA tracks live admission load.
pub struct StaticFleet {
    registry: FleetRegistry,
    pool: Mutex<Pool>,
}

impl StaticFleet {
    pub fn new(registry: FleetRegistry, slots: &[String]) -> anyhow::Result<Self> {
        let free = slots
            .iter()
            .map(|s| parse_slot(s))
            .collect::<anyhow::Result<VecDeque<_>>>()?;
        Ok(Self {
            registry,
            pool: Mutex::new(Pool {
                free,
                ..Default::default()
            }),
        })
    }

    pub fn free_slots(&self) -> usize {
        self.pool.lock().free.len()
    }
}

fn parse_slot(s: &str) -> anyhow::Result<Slot> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("fleet slot {s:?} is not host:port"))?;
    let port = port
        .parse()
        .with_context(|| format!("fleet slot {s:?} has an invalid port"))?;
    Ok(Slot {
        host: host.to_string(),
        port,
    })
}

#[async_trait]
impl FleetApi for StaticFleet {
    async fn create_instance(&self) -> anyhow::Result<InstanceDescriptor> {
        let mut pool = self.pool.lock();
        let Some(slot) = pool.free.pop_front() else {
            bail!("no free fleet slots");
        };
        pool.next_id += 1;
        let id = format!("slot-{}", pool.next_id);
        pool.leased.insert(id.clone(), slot.clone());
        info!(instance_id = %id, host = %slot.host, port = slot.port, "fleet slot leased");
        Ok(InstanceDescriptor {
            id,
            host: slot.host,
            port: slot.port,
        })
    }

    async fn terminate_instance(&self, id: &str) -> anyhow::Result<()> {
        let mut pool = self.pool.lock();
        match pool.leased.remove(id) {
            Some(slot) => {
                info!(instance_id = %id, "fleet slot returned");
                pool.free.push_back(slot);
            }
            // Workers from the initial configuration are not pool slots.
            None => info!(instance_id = %id, "released worker outside the slot pool"),
        }
        Ok(())
    }

    async fn fetch_utilization(
        &self,
        ids: &[WorkerId],
        _window: Duration,
    ) -> anyhow::Result<HashMap<WorkerId, Vec<f64>>> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.registry
                    .get(id)
                    .map(|worker| (id.clone(), vec![worker.utilization()]))
            })
            .collect())
    }
}
