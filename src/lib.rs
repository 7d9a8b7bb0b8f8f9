//! valkey-cluster-client
//!
//! Cluster topology manager for Valkey/Redis cluster clients: discovers
//! the cluster from seed addresses, keeps a lock-free slot routing table
//! current while traffic is in flight, and reconciles against the
//! cluster's gossip state on a periodic monitor loop.

pub mod client;
pub mod cluster;
pub mod config;
pub mod utils;

pub use client::{ClientHandle, ConnectionPool, FreezeReason, NodeRole, PoolFactory};
pub use cluster::{
    calc_slot, ClusterManager, ConnectionManager, MasterSlaveEntry, NodeAddress, MAX_SLOT,
};
pub use config::{ClusterConfig, ReadMode};
pub use utils::{ClusterError, Result};
