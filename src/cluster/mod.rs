//! Cluster topology management
//!
//! This module provides:
//! - `CLUSTER NODES` gossip parsing into canonical partitions
//! - Slot mapping and CRC16 slot calculation
//! - The lock-free slot router and refcounted partition entries
//! - The bootstrap and periodic reconciliation loop

pub mod address;
pub mod entry;
pub mod manager;
pub mod node_info;
pub mod parser;
pub mod partition;
pub mod router;
pub mod slot;

pub use address::NodeAddress;
pub use entry::MasterSlaveEntry;
pub use manager::{ClusterManager, ConnectionManager};
pub use node_info::{parse_cluster_nodes, parse_node_line, NodeFlag, RawNodeInfo};
pub use parser::parse_partitions;
pub use partition::{ClusterPartition, PartitionType, SlotRange, SlotSet};
pub use router::SlotRouter;
pub use slot::{calc_slot, calc_slot_str, MAX_SLOT};
