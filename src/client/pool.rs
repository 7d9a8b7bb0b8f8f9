//! Per-partition connection pools
//!
//! The topology manager drives pools through the [`ConnectionPool`]
//! capability trait and never looks inside them. [`BasicPool`] is the
//! built-in implementation: it verifies reachability over control
//! connections and tracks member up/down state, leaving command
//! multiplexing to the embedding client.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::cluster::address::NodeAddress;
use crate::utils::ConnectionError;

use super::node_connection::NodeConnection;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle identifying one client inside a pool.
///
/// Identity is the handle id, not the address: a failover produces a new
/// handle for the same entry.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    addr: NodeAddress,
}

impl ClientHandle {
    pub fn new(addr: NodeAddress) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &NodeAddress {
        &self.addr
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

impl std::hash::Hash for ClientHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Slave,
}

/// Who initiated a slave freeze/unfreeze transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeReason {
    /// The topology manager reacting to cluster state.
    Manager,
    /// A reconnect cycle.
    Reconnect,
    /// A system error on the connection.
    SystemError,
}

/// One pool member as seen from outside.
#[derive(Debug, Clone)]
pub struct PoolMember {
    pub address: NodeAddress,
    pub role: NodeRole,
}

/// Capability interface the topology manager drives pools through.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Connect the master client. Must be called before any other method.
    async fn setup_master(&self, sni: Option<&str>) -> Result<ClientHandle, ConnectionError>;

    /// Bring up the configured slaves, freezing the given failed set.
    async fn init_slave_balancer(
        &self,
        failed: &HashSet<NodeAddress>,
        sni: Option<&str>,
    ) -> Result<(), ConnectionError>;

    /// Add a slave discovered after pool creation.
    async fn add_slave(
        &self,
        addr: NodeAddress,
        readonly: bool,
        role: NodeRole,
        sni: Option<&str>,
    ) -> Result<(), ConnectionError>;

    /// Swap the master to a new address, returning the new master client.
    async fn change_master(
        &self,
        addr: NodeAddress,
        sni: Option<&str>,
    ) -> Result<ClientHandle, ConnectionError>;

    fn has_slave(&self, addr: &NodeAddress) -> bool;

    fn get_member(&self, addr: &NodeAddress) -> Option<PoolMember>;

    fn all_members(&self) -> Vec<PoolMember>;

    /// Unfreeze a slave. Returns true when the slave actually came up.
    fn slave_up(&self, addr: &NodeAddress, reason: FreezeReason) -> bool;

    /// Freeze a slave. Returns true when the slave actually went down.
    fn slave_down(&self, addr: &NodeAddress, reason: FreezeReason) -> bool;

    /// Mark the master down ahead of pool shutdown.
    fn master_down(&self);

    /// Mark a member's connections dead.
    fn node_down(&self, member: &PoolMember);

    /// Release all pool resources. Idempotent.
    async fn shutdown(&self);
}

/// Creates pools for newly discovered masters.
pub trait PoolFactory: Send + Sync {
    fn create(
        &self,
        master: NodeAddress,
        slaves: HashSet<NodeAddress>,
        readonly_slaves: bool,
    ) -> Arc<dyn ConnectionPool>;
}

#[derive(Debug, Clone)]
struct SlaveState {
    frozen: Option<FreezeReason>,
    connected: bool,
}

/// Built-in pool implementation over control connections.
pub struct BasicPool {
    config: ClusterConfig,
    master_addr: RwLock<NodeAddress>,
    master: RwLock<Option<ClientHandle>>,
    slaves: RwLock<HashMap<NodeAddress, SlaveState>>,
    readonly_slaves: bool,
    shut_down: AtomicBool,
}

impl BasicPool {
    pub fn new(
        config: ClusterConfig,
        master: NodeAddress,
        slaves: HashSet<NodeAddress>,
        readonly_slaves: bool,
    ) -> Self {
        let slaves = slaves
            .into_iter()
            .map(|addr| {
                (
                    addr,
                    SlaveState {
                        frozen: None,
                        connected: false,
                    },
                )
            })
            .collect();
        Self {
            config,
            master_addr: RwLock::new(master),
            master: RwLock::new(None),
            slaves: RwLock::new(slaves),
            readonly_slaves,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Whether slave clients are opened read-only.
    pub fn readonly_slaves(&self) -> bool {
        self.readonly_slaves
    }

    /// Whether the slave's connections are currently established.
    pub fn is_slave_connected(&self, addr: &NodeAddress) -> bool {
        self.slaves
            .read()
            .get(addr)
            .map(|state| state.connected)
            .unwrap_or(false)
    }

    async fn verify_reachable(
        &self,
        addr: &NodeAddress,
        sni: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let mut conn = NodeConnection::connect(addr, &self.config, sni).await?;
        conn.ping().await
    }
}

#[async_trait]
impl ConnectionPool for BasicPool {
    async fn setup_master(&self, sni: Option<&str>) -> Result<ClientHandle, ConnectionError> {
        let addr = self.master_addr.read().clone();
        self.verify_reachable(&addr, sni).await?;
        let handle = ClientHandle::new(addr.clone());
        *self.master.write() = Some(handle.clone());
        debug!("master client ready for {}", addr);
        Ok(handle)
    }

    async fn init_slave_balancer(
        &self,
        failed: &HashSet<NodeAddress>,
        sni: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let addrs: Vec<NodeAddress> = self.slaves.read().keys().cloned().collect();
        for addr in addrs {
            if failed.contains(&addr) {
                if let Some(state) = self.slaves.write().get_mut(&addr) {
                    state.frozen = Some(FreezeReason::SystemError);
                }
                continue;
            }
            self.verify_reachable(&addr, sni).await?;
            if let Some(state) = self.slaves.write().get_mut(&addr) {
                state.connected = true;
            }
        }
        Ok(())
    }

    async fn add_slave(
        &self,
        addr: NodeAddress,
        _readonly: bool,
        role: NodeRole,
        sni: Option<&str>,
    ) -> Result<(), ConnectionError> {
        debug_assert_eq!(role, NodeRole::Slave);
        self.verify_reachable(&addr, sni).await?;
        self.slaves.write().insert(
            addr,
            SlaveState {
                frozen: None,
                connected: true,
            },
        );
        Ok(())
    }

    async fn change_master(
        &self,
        addr: NodeAddress,
        sni: Option<&str>,
    ) -> Result<ClientHandle, ConnectionError> {
        if *self.master_addr.read() == addr {
            if let Some(current) = self.master.read().clone() {
                return Ok(current);
            }
        }

        self.verify_reachable(&addr, sni).await?;
        let handle = ClientHandle::new(addr.clone());
        *self.master_addr.write() = addr.clone();
        *self.master.write() = Some(handle.clone());
        // the promoted node stops being a slave member
        self.slaves.write().remove(&addr);
        Ok(handle)
    }

    fn has_slave(&self, addr: &NodeAddress) -> bool {
        self.slaves.read().contains_key(addr)
    }

    fn get_member(&self, addr: &NodeAddress) -> Option<PoolMember> {
        if *self.master_addr.read() == *addr {
            return Some(PoolMember {
                address: addr.clone(),
                role: NodeRole::Master,
            });
        }
        self.slaves.read().get(addr).map(|_| PoolMember {
            address: addr.clone(),
            role: NodeRole::Slave,
        })
    }

    fn all_members(&self) -> Vec<PoolMember> {
        let mut members = vec![PoolMember {
            address: self.master_addr.read().clone(),
            role: NodeRole::Master,
        }];
        members.extend(self.slaves.read().keys().map(|addr| PoolMember {
            address: addr.clone(),
            role: NodeRole::Slave,
        }));
        members
    }

    fn slave_up(&self, addr: &NodeAddress, _reason: FreezeReason) -> bool {
        match self.slaves.write().get_mut(addr) {
            Some(state) if state.frozen.is_some() => {
                state.frozen = None;
                state.connected = true;
                true
            }
            _ => false,
        }
    }

    fn slave_down(&self, addr: &NodeAddress, reason: FreezeReason) -> bool {
        match self.slaves.write().get_mut(addr) {
            Some(state) if state.frozen.is_none() => {
                state.frozen = Some(reason);
                state.connected = false;
                true
            }
            _ => false,
        }
    }

    fn master_down(&self) {
        *self.master.write() = None;
    }

    fn node_down(&self, member: &PoolMember) {
        if let Some(state) = self.slaves.write().get_mut(&member.address) {
            state.connected = false;
        }
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slaves.write().clear();
        *self.master.write() = None;
        debug!("pool for {} shut down", self.master_addr.read());
    }
}

/// Factory producing [`BasicPool`] instances from the shared configuration.
pub struct BasicPoolFactory {
    config: ClusterConfig,
}

impl BasicPoolFactory {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }
}

impl PoolFactory for BasicPoolFactory {
    fn create(
        &self,
        master: NodeAddress,
        slaves: HashSet<NodeAddress>,
        readonly_slaves: bool,
    ) -> Arc<dyn ConnectionPool> {
        Arc::new(BasicPool::new(
            self.config.clone(),
            master,
            slaves,
            readonly_slaves,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_slave() -> (BasicPool, NodeAddress, NodeAddress) {
        let master = NodeAddress::new("10.0.0.1", 7000);
        let slave = NodeAddress::new("10.0.0.2", 7001);
        let config = ClusterConfig::new(vec![master.clone()]);
        let pool = BasicPool::new(
            config,
            master.clone(),
            HashSet::from([slave.clone()]),
            true,
        );
        (pool, master, slave)
    }

    #[test]
    fn client_handles_are_unique() {
        let addr = NodeAddress::new("10.0.0.1", 7000);
        let a = ClientHandle::new(addr.clone());
        let b = ClientHandle::new(addr);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn membership_queries() {
        let (pool, master, slave) = pool_with_slave();
        assert!(pool.has_slave(&slave));
        assert!(!pool.has_slave(&master));

        let member = pool.get_member(&slave).unwrap();
        assert_eq!(member.role, NodeRole::Slave);
        assert_eq!(pool.get_member(&master).unwrap().role, NodeRole::Master);
        assert_eq!(pool.all_members().len(), 2);
    }

    #[test]
    fn slave_up_down_transitions() {
        let (pool, _, slave) = pool_with_slave();

        // down on an up slave succeeds once
        assert!(pool.slave_down(&slave, FreezeReason::Manager));
        assert!(!pool.slave_down(&slave, FreezeReason::Manager));
        assert!(!pool.is_slave_connected(&slave));

        // up on a frozen slave succeeds once
        assert!(pool.slave_up(&slave, FreezeReason::Manager));
        assert!(!pool.slave_up(&slave, FreezeReason::Manager));

        // unknown slave is a no-op
        assert!(!pool.slave_up(&NodeAddress::new("10.9.9.9", 1), FreezeReason::Manager));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (pool, _, _) = pool_with_slave();
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.all_members().len() == 1); // slaves cleared, master addr remains
    }
}
