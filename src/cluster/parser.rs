//! Snapshot-to-partition parsing
//!
//! Turns an ordered gossip snapshot into the canonical partition set: one
//! partition per logical master, slaves folded in, cascade slaves (slaves
//! of slaves) flattened onto the master they ultimately replicate.
//!
//! Resolution failures demote single nodes, never the whole parse. The
//! slave→master parent link lives only in the builders local to this
//! module.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use crate::client::resolver::{resolve_address, AddressResolver};

use super::address::NodeAddress;
use super::node_info::{NodeFlag, RawNodeInfo};
use super::partition::{ClusterPartition, PartitionType, SlotRange};

#[derive(Default)]
struct PartitionBuilder {
    ptype: Option<PartitionType>,
    master_address: Option<NodeAddress>,
    slave_addresses: HashSet<NodeAddress>,
    failed_slaves: HashSet<NodeAddress>,
    slot_ranges: Vec<SlotRange>,
    master_fail: bool,
    parent: Option<String>,
}

/// Parse a gossip snapshot into master partitions.
///
/// All hostname resolutions run concurrently; a node whose address fails
/// to resolve is omitted from the output.
pub async fn parse_partitions(
    nodes: &[RawNodeInfo],
    resolver: &dyn AddressResolver,
) -> Vec<Arc<ClusterPartition>> {
    let mut eligible: Vec<(&RawNodeInfo, String)> = Vec::new();
    for node in nodes {
        if node.has_flag(NodeFlag::Noaddr)
            || node.has_flag(NodeFlag::Handshake)
            || node.address.is_none()
            || (node.slot_ranges.is_empty() && node.has_flag(NodeFlag::Master))
        {
            continue;
        }

        let master_id = if node.has_flag(NodeFlag::Slave) {
            match &node.slave_of {
                Some(id) => id.clone(),
                None => continue,
            }
        } else {
            node.node_id.clone()
        };

        eligible.push((node, master_id));
    }

    let resolutions = join_all(eligible.iter().map(|(node, _)| {
        let address = node.address.as_ref().expect("filtered above");
        resolve_address(resolver, address)
    }))
    .await;

    // Fold sequentially so output is deterministic given resolver outcomes.
    let mut builders: HashMap<String, PartitionBuilder> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let touch = |builders: &mut HashMap<String, PartitionBuilder>,
                 order: &mut Vec<String>,
                 id: &str| {
        if !builders.contains_key(id) {
            builders.insert(id.to_string(), PartitionBuilder::default());
            order.push(id.to_string());
        }
    };

    for ((node, master_id), resolution) in eligible.iter().zip(resolutions) {
        let address = match resolution {
            Ok(address) => address,
            Err(e) => {
                warn!(
                    "skipping node {}: failed to resolve {}: {}",
                    node.node_id,
                    node.address.as_ref().expect("filtered above"),
                    e
                );
                continue;
            }
        };

        if node.has_flag(NodeFlag::Slave) {
            touch(&mut builders, &mut order, master_id);
            {
                let master = builders.get_mut(master_id).expect("just touched");
                master.slave_addresses.insert(address.clone());
                if node.has_flag(NodeFlag::Fail) {
                    master.failed_slaves.insert(address.clone());
                }
            }

            touch(&mut builders, &mut order, &node.node_id);
            let slave = builders.get_mut(&node.node_id).expect("just touched");
            slave.ptype = Some(PartitionType::Slave);
            slave.parent = Some(master_id.clone());
        } else if node.has_flag(NodeFlag::Master) {
            touch(&mut builders, &mut order, master_id);
            let master = builders.get_mut(master_id).expect("just touched");
            master.slot_ranges.extend(node.slot_ranges.iter().copied());
            master.master_address = Some(address);
            master.ptype = Some(PartitionType::Master);
            if node.has_flag(NodeFlag::Fail) {
                master.master_fail = true;
            }
        }
    }

    flatten_cascade_slaves(&mut builders);

    order
        .iter()
        .filter_map(|id| {
            let builder = builders.remove(id)?;
            if builder.ptype != Some(PartitionType::Master) {
                return None;
            }
            let address = builder.master_address?;

            let partition = ClusterPartition::new(id.clone());
            partition.set_master_address(address);
            partition.add_slot_ranges(&builder.slot_ranges);
            partition.set_master_fail(builder.master_fail);
            for slave in builder.slave_addresses {
                partition.add_slave_address(slave);
            }
            for failed in builder.failed_slaves {
                partition.add_failed_slave_address(failed);
            }
            Some(Arc::new(partition))
        })
        .collect()
}

/// Copy each slave partition's replica sets onto its master parent, then
/// drop all slave partitions.
fn flatten_cascade_slaves(builders: &mut HashMap<String, PartitionBuilder>) {
    let slave_ids: Vec<String> = builders
        .iter()
        .filter(|(_, b)| b.ptype == Some(PartitionType::Slave))
        .map(|(id, _)| id.clone())
        .collect();

    for id in slave_ids {
        let Some(slave) = builders.remove(&id) else {
            continue;
        };

        let parent_is_master = slave
            .parent
            .as_ref()
            .and_then(|pid| builders.get(pid))
            .is_some_and(|parent| parent.ptype == Some(PartitionType::Master));
        if !parent_is_master {
            continue;
        }

        let parent_id = slave.parent.expect("checked above");
        let parent = builders.get_mut(&parent_id).expect("checked above");
        parent.slave_addresses.extend(slave.slave_addresses);
        parent.failed_slaves.extend(slave.failed_slaves);
    }
}
