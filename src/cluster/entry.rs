//! Refcounted per-partition entries
//!
//! One [`MasterSlaveEntry`] fronts the pool serving one partition. The
//! reference count equals the number of slots currently routed to the
//! entry; the registry tears the pool down when the count reaches zero.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::pool::{
    ClientHandle, ConnectionPool, FreezeReason, NodeRole, PoolMember,
};
use crate::utils::ConnectionError;

use super::address::NodeAddress;

pub struct MasterSlaveEntry {
    pool: Arc<dyn ConnectionPool>,
    master_client: RwLock<ClientHandle>,
    refs: AtomicUsize,
}

impl MasterSlaveEntry {
    /// Wrap a pool whose master client has been set up.
    pub fn new(pool: Arc<dyn ConnectionPool>, master_client: ClientHandle) -> Self {
        Self {
            pool,
            master_client: RwLock::new(master_client),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    pub fn master_client(&self) -> ClientHandle {
        self.master_client.read().clone()
    }

    /// Take a slot reference. Returns the new count.
    pub fn inc_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a slot reference. Returns the new count.
    pub fn dec_ref(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn has_slave(&self, addr: &NodeAddress) -> bool {
        self.pool.has_slave(addr)
    }

    pub fn get_member(&self, addr: &NodeAddress) -> Option<PoolMember> {
        self.pool.get_member(addr)
    }

    pub fn all_members(&self) -> Vec<PoolMember> {
        self.pool.all_members()
    }

    /// Swap the master to a new address and rebind the cached client handle.
    pub async fn change_master(
        &self,
        addr: NodeAddress,
        sni: Option<&str>,
    ) -> Result<ClientHandle, ConnectionError> {
        let client = self.pool.change_master(addr, sni).await?;
        *self.master_client.write() = client.clone();
        Ok(client)
    }

    pub async fn add_slave(
        &self,
        addr: NodeAddress,
        readonly: bool,
        sni: Option<&str>,
    ) -> Result<(), ConnectionError> {
        self.pool.add_slave(addr, readonly, NodeRole::Slave, sni).await
    }

    pub async fn init_slave_balancer(
        &self,
        failed: &HashSet<NodeAddress>,
        sni: Option<&str>,
    ) -> Result<(), ConnectionError> {
        self.pool.init_slave_balancer(failed, sni).await
    }

    pub fn slave_up(&self, addr: &NodeAddress, reason: FreezeReason) -> bool {
        self.pool.slave_up(addr, reason)
    }

    pub fn slave_down(&self, addr: &NodeAddress, reason: FreezeReason) -> bool {
        self.pool.slave_down(addr, reason)
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for MasterSlaveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterSlaveEntry")
            .field("master", self.master_client.read().addr())
            .field("refs", &self.ref_count())
            .finish()
    }
}
