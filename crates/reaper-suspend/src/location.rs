//! Location resolver — which zone to send a node's delete to.
//!
//! Static partitions carry their zone in config. Regional-capacity
//! partitions are looked up in the live inventory, once per partition per
//! run; the result (or the failure) is cached for every later node of
//! that partition.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use reaper_compute::ComputeApi;
use reaper_core::{ConfigError, Hostname, Node, ReaperConfig};

use crate::error::{SuspendError, SuspendResult};

/// Where a node's instance lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Zone(String),
    /// Regional node not found in the inventory; already deleted.
    Absent,
}

/// Cached inventory of one regional partition: hostname → zone.
type RegionalInventory = Result<HashMap<Hostname, String>, String>;

pub struct LocationResolver {
    compute: Arc<dyn ComputeApi>,
    config: Arc<ReaperConfig>,
    inventories: HashMap<String, RegionalInventory>,
}

impl LocationResolver {
    pub fn new(compute: Arc<dyn ComputeApi>, config: Arc<ReaperConfig>) -> Self {
        Self {
            compute,
            config,
            inventories: HashMap::new(),
        }
    }

    /// Number of inventory lookups issued so far.
    pub fn lookups(&self) -> usize {
        self.inventories.len()
    }

    pub async fn resolve(&mut self, node: &Node) -> SuspendResult<Location> {
        let def = self.config.instance_def(&node.partition_id)?;

        if !def.regional_capacity {
            let zone = def.zone.clone().ok_or_else(|| {
                ConfigError::Invalid(format!("instance_defs.{}: zone is required", node.partition_id))
            })?;
            return Ok(Location::Zone(zone));
        }

        let region = def.region().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "instance_defs.{}: regional capacity requires a region",
                node.partition_id
            ))
        })?;

        if !self.inventories.contains_key(&node.partition_id) {
            let inventory = self.lookup(&region, &node.partition_id).await;
            self.inventories.insert(node.partition_id.clone(), inventory);
        }

        match &self.inventories[&node.partition_id] {
            Ok(instances) => match instances.get(&node.hostname) {
                Some(zone) => Ok(Location::Zone(zone.clone())),
                None => {
                    debug!(node = %node.hostname, "regional node not found, already deleted");
                    Ok(Location::Absent)
                }
            },
            Err(message) => Err(SuspendError::Lookup {
                partition: node.partition_id.clone(),
                message: message.clone(),
            }),
        }
    }

    async fn lookup(&self, region: &str, partition_id: &str) -> RegionalInventory {
        match self.compute.list_instances(region, partition_id).await {
            Ok(instances) => {
                debug!(
                    partition = partition_id,
                    region,
                    count = instances.len(),
                    "regional inventory loaded"
                );
                Ok(instances
                    .into_iter()
                    .map(|inst| {
                        let zone = inst.zone_name().to_string();
                        (inst.name, zone)
                    })
                    .collect())
            }
            Err(e) => {
                warn!(partition = partition_id, region, error = %e, "regional inventory lookup failed");
                Err(e.to_string())
            }
        }
    }
}
