//! Cluster topology manager
//!
//! Bootstraps the routing state from seed addresses, then runs the
//! periodic reconciliation loop: fetch a `CLUSTER NODES` snapshot from a
//! candidate node, parse it into partitions, and diff against the current
//! state in fixed order (masters, slaves, slot migration, slot coverage).
//!
//! A tick schedules its successor from its own terminal path, so at most
//! one tick is ever in flight. The shutdown latch is held for the whole
//! snapshot-and-diff span; shutdown drains it before tearing anything
//! down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::node_connection::{ControlPlane, NodeConnections};
use crate::client::pool::{BasicPoolFactory, ClientHandle, FreezeReason, PoolFactory};
use crate::client::resolver::{AddressResolver, DnsResolver};
use crate::client::subscribe::{NoopSubscribeService, SubscribeService};
use crate::config::ClusterConfig;
use crate::utils::{ClusterError, ProtocolError, Result, ShutdownLatch};

use super::address::NodeAddress;
use super::entry::MasterSlaveEntry;
use super::node_info::parse_cluster_nodes;
use super::parser::parse_partitions;
use super::partition::ClusterPartition;
use super::router::SlotRouter;
use super::slot::{calc_slot, MAX_SLOT};

/// Routing interface exposed to the request layer.
///
/// The cluster manager is one implementation; a single-master manager
/// would be another. These are the explicit virtual-call points.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    fn calc_slot(&self, key: &[u8]) -> u16;

    fn is_cluster_mode(&self) -> bool;

    fn entry_for_slot(&self, slot: u16) -> Option<Arc<MasterSlaveEntry>>;

    fn entry_for_client(&self, client: &ClientHandle) -> Option<Arc<MasterSlaveEntry>>;

    fn entry_for_addr(&self, addr: &NodeAddress) -> Option<Arc<MasterSlaveEntry>>;

    fn entry_set(&self) -> Vec<Arc<MasterSlaveEntry>>;

    fn apply_nat_map(&self, addr: NodeAddress) -> NodeAddress;

    fn last_cluster_node(&self) -> Option<NodeAddress>;

    /// Rebind a slot's entry to a new master address.
    async fn change_master(&self, slot: u16, address: NodeAddress) -> Result<ClientHandle>;

    async fn shutdown(&self);
}

pub struct ClusterManager {
    config: ClusterConfig,
    /// Seed hostname kept for TLS SNI and periodic re-resolution; set only
    /// when a single non-IP seed was configured.
    config_endpoint_host: Option<String>,
    router: SlotRouter,
    /// Monitor-only diff state: slot -> partition of the last accepted
    /// snapshot. Kept off the router so hot-path reads never touch it.
    slot_to_partition: RwLock<HashMap<u16, Arc<ClusterPartition>>>,
    connections: Arc<dyn ControlPlane>,
    pool_factory: Arc<dyn PoolFactory>,
    resolver: Arc<dyn AddressResolver>,
    subscribe_service: Arc<dyn SubscribeService>,
    shutdown_latch: ShutdownLatch,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    last_cluster_node: RwLock<Option<NodeAddress>>,
}

impl ClusterManager {
    /// Bootstrap against the configured seeds and start the topology
    /// monitor. Fails only at startup; at runtime the manager self-heals.
    pub async fn connect(config: ClusterConfig) -> Result<Arc<Self>> {
        let connections = Arc::new(NodeConnections::new(config.clone()));
        let pool_factory = Arc::new(BasicPoolFactory::new(config.clone()));
        Self::connect_with(
            config,
            connections,
            pool_factory,
            Arc::new(DnsResolver),
            Arc::new(NoopSubscribeService),
        )
        .await
    }

    /// Bootstrap with explicit collaborators. Test and integration seam.
    pub async fn connect_with(
        config: ClusterConfig,
        connections: Arc<dyn ControlPlane>,
        pool_factory: Arc<dyn PoolFactory>,
        resolver: Arc<dyn AddressResolver>,
        subscribe_service: Arc<dyn SubscribeService>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let manager = Arc::new(Self {
            config_endpoint_host: config.config_endpoint_host(),
            router: SlotRouter::new(),
            slot_to_partition: RwLock::new(HashMap::new()),
            connections,
            pool_factory,
            resolver,
            subscribe_service,
            shutdown_latch: ShutdownLatch::new(),
            monitor_task: Mutex::new(None),
            last_cluster_node: RwLock::new(None),
            config,
        });

        let mut last_error: Option<ClusterError> = None;
        let mut failed_masters: Vec<String> = Vec::new();
        for seed in manager.config.node_addresses.clone() {
            let seed = manager.apply_nat_map(seed);
            match manager.bootstrap_from_seed(&seed, &mut failed_masters).await {
                Ok(seed_error) => {
                    if let Some(e) = seed_error {
                        last_error = Some(e);
                    }
                    break;
                }
                Err(e) => {
                    warn!("seed {} failed: {}", seed, e);
                    last_error = Some(e);
                }
            }
        }

        if manager.slot_to_partition.read().is_empty() {
            manager.cleanup_after_failed_start().await;
            let last_error = last_error.map(|e| e.to_string());
            return Err(if failed_masters.is_empty() {
                ClusterError::NoSeedsAvailable {
                    seeds: manager
                        .config
                        .node_addresses
                        .iter()
                        .map(|a| a.to_string())
                        .collect(),
                    last_error,
                }
            } else {
                ClusterError::FailedMasters {
                    masters: failed_masters,
                    last_error,
                }
            });
        }

        if manager.config.check_slots_coverage {
            let available = manager.slot_to_partition.read().len();
            if available != MAX_SLOT as usize {
                manager.cleanup_after_failed_start().await;
                return Err(ClusterError::Coverage {
                    available,
                    failed_masters,
                });
            }
        }

        Self::schedule_change_check(&manager);
        info!(
            "cluster topology manager started, {} slots mapped",
            manager.slot_to_partition.read().len()
        );
        Ok(manager)
    }

    fn sni(&self) -> Option<&str> {
        self.config_endpoint_host.as_deref()
    }

    /// Try one seed: fetch, parse, and add every non-failed master.
    ///
    /// Returns `Ok` when the snapshot parsed, carrying the first master
    /// addition error if any; `Err` advances the seed loop.
    async fn bootstrap_from_seed(
        &self,
        seed: &NodeAddress,
        failed_masters: &mut Vec<String>,
    ) -> Result<Option<ClusterError>> {
        let text = self.connections.cluster_nodes(seed, self.sni()).await?;
        info!("cluster nodes configuration got from {}:\n{}", seed, text);

        let tls = seed.is_tls() || self.config.tls.is_some();
        let nodes = parse_cluster_nodes(&text, tls)?;
        *self.last_cluster_node.write() = Some(seed.clone());

        let partitions = parse_partitions(&nodes, self.resolver.as_ref()).await;
        let mut additions = Vec::new();
        for partition in &partitions {
            if partition.is_master_fail() {
                if let Some(addr) = partition.master_address() {
                    failed_masters.push(addr.to_string());
                }
                continue;
            }
            additions.push(self.add_master_entry(Arc::clone(partition)));
        }

        let results = join_all(additions).await;
        Ok(results.into_iter().find_map(|r| r.err()))
    }

    /// Create the entry for a freshly discovered master and route its
    /// slots. The master is installed before the slave balancer runs, so
    /// slave failures propagate without undoing the master.
    async fn add_master_entry(&self, partition: Arc<ClusterPartition>) -> Result<()> {
        if partition.is_master_fail() {
            return Err(ClusterError::MasterFailed {
                address: partition
                    .master_address()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                ranges: partition.ranges_display(),
            });
        }
        let address = partition
            .master_address()
            .ok_or_else(|| ClusterError::MasterWithoutAddress {
                node_id: partition.node_id().to_string(),
            })?;

        if let Err(e) = self.connections.ensure_node(&address, self.sni()).await {
            error!(
                "can't connect to master: {} with slot ranges: {}",
                address,
                partition.ranges_display()
            );
            return Err(e);
        }

        let skip_slaves = self.config.check_skip_slaves_init;
        let slaves = if skip_slaves {
            HashSet::new()
        } else {
            partition.slave_addresses()
        };
        let pool = self
            .pool_factory
            .create(address.clone(), slaves, self.config.readonly_slaves());

        let client = match pool.setup_master(self.sni()).await {
            Ok(client) => client,
            Err(e) => {
                error!(
                    "can't add master: {} for slot ranges: {}: {}",
                    address,
                    partition.ranges_display(),
                    e
                );
                return Err(e.into());
            }
        };

        let entry = Arc::new(MasterSlaveEntry::new(pool, client));
        for slot in partition.slots().iter() {
            self.add_entry(slot, &entry);
            self.slot_to_partition
                .write()
                .insert(slot, Arc::clone(&partition));
        }

        if !skip_slaves {
            if let Err(e) = entry
                .init_slave_balancer(&partition.failed_slave_addresses(), self.sni())
                .await
            {
                error!(
                    "unable to add slave for: {} slot ranges: {}: {}",
                    address,
                    partition.ranges_display(),
                    e
                );
                return Err(e.into());
            }

            let slaves = partition.slave_addresses();
            if !slaves.is_empty() {
                info!(
                    "slaves: {:?} added for slot ranges: {}",
                    display_addrs(&slaves),
                    partition.ranges_display()
                );
                let failed = partition.failed_slave_addresses();
                if !failed.is_empty() {
                    warn!(
                        "slaves: {:?} are down for slot ranges: {}",
                        display_addrs(&failed),
                        partition.ranges_display()
                    );
                }
            }
        }

        info!(
            "master: {} added for slot ranges: {}",
            address,
            partition.ranges_display()
        );
        Ok(())
    }

    /// Route a slot to an entry. Takes the new reference before swapping
    /// so a concurrent release can never free a reinstalled entry.
    fn add_entry(&self, slot: u16, entry: &Arc<MasterSlaveEntry>) {
        entry.inc_ref();
        let old = self.router.swap(slot, Some(Arc::clone(entry)));
        match old {
            Some(old) if Arc::ptr_eq(&old, entry) => {
                // cell already pointed here; drop the extra reference
                entry.dec_ref();
            }
            Some(old) => self.shutdown_entry(&old),
            None => {}
        }
        self.router.bind_client(entry.master_client(), Arc::clone(entry));
    }

    fn remove_entry(&self, slot: u16) {
        if let Some(old) = self.router.swap(slot, None) {
            self.shutdown_entry(&old);
        }
    }

    /// Drop one slot reference; on the last one, tear the pool down.
    fn shutdown_entry(&self, entry: &Arc<MasterSlaveEntry>) {
        if entry.dec_ref() != 0 {
            return;
        }

        let master = entry.master_client();
        self.router.unbind_client(&master);

        let members = entry.all_members();
        for member in &members {
            entry.pool().node_down(member);
        }
        entry.pool().master_down();

        let pool_entry = Arc::clone(entry);
        tokio::spawn(async move {
            pool_entry.shutdown().await;
        });
        self.subscribe_service.remove(entry);

        let slaves: Vec<String> = members
            .iter()
            .filter(|m| m.address != *master.addr())
            .map(|m| m.address.to_string())
            .collect();
        info!(
            "{} master and related slaves: {} removed",
            master.addr(),
            slaves.join(",")
        );
    }

    /// Arm the next monitor tick. Each tick reschedules itself from its
    /// terminal path, so ticks never overlap.
    ///
    /// Only the timer is tracked for cancellation; a tick already past the
    /// timer runs to completion under the shutdown latch, and its in-flight
    /// master additions complete and log their outcome.
    fn schedule_change_check(manager: &Arc<Self>) {
        let tick_manager = Arc::clone(manager);
        let interval = manager.config.scan_interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let runner = Arc::clone(&tick_manager);
            tokio::spawn(async move {
                if runner.check_cluster_state().await && !runner.shutdown_latch.is_closed() {
                    Self::schedule_change_check(&runner);
                }
            });
        });
        *manager.monitor_task.lock() = Some(handle);
    }

    /// One monitor tick. Returns false only when shutdown refused the
    /// latch, in which case no further ticks are scheduled.
    pub(crate) async fn check_cluster_state(&self) -> bool {
        let (candidates, mut last_error) = self.build_candidates().await;

        for uri in candidates {
            let Some(guard) = self.shutdown_latch.acquire() else {
                return false;
            };
            let result = self.refresh_from_candidate(&uri).await;
            drop(guard);

            match result {
                Ok(()) => return true,
                Err(ClusterError::Protocol(ProtocolError::EmptyNodes)) => {
                    debug!(
                        "cluster nodes state got from {} doesn't contain any nodes",
                        uri
                    );
                }
                Err(e) => {
                    self.connections.disconnect(&uri);
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            error!("can't update cluster state: {}", e);
        }
        true
    }

    /// Candidate nodes for this tick.
    ///
    /// Endpoint-hostname mode re-resolves the configured hostname (the
    /// cluster may hide behind a load balancer); gossip mode shuffles the
    /// known masters and live slaves, masters first.
    async fn build_candidates(&self) -> (Vec<NodeAddress>, Option<ClusterError>) {
        if let Some(host) = &self.config_endpoint_host {
            let seed = self
                .config
                .node_addresses
                .first()
                .cloned()
                .expect("config validated non-empty");
            return match self.resolver.resolve_all(host, seed.port()).await {
                Ok(sockets) => (
                    sockets
                        .into_iter()
                        .map(|s| {
                            NodeAddress::new(s.ip().to_string(), s.port())
                                .with_tls(seed.is_tls())
                        })
                        .collect(),
                    None,
                ),
                Err(e) => (
                    Vec::new(),
                    Some(ClusterError::Resolve {
                        host: host.clone(),
                        source: e,
                    }),
                ),
            };
        }

        let mut masters = Vec::new();
        let mut slaves: HashSet<NodeAddress> = HashSet::new();
        for partition in self.last_partitions() {
            if !partition.is_master_fail() {
                if let Some(addr) = partition.master_address() {
                    masters.push(addr);
                }
            }
            let failed = partition.failed_slave_addresses();
            for slave in partition.slave_addresses() {
                if !failed.contains(&slave) {
                    slaves.insert(slave);
                }
            }
        }

        let mut slaves: Vec<NodeAddress> = slaves.into_iter().collect();
        fastrand::shuffle(&mut masters);
        fastrand::shuffle(&mut slaves);
        masters.extend(slaves);
        (masters, None)
    }

    /// Fetch a snapshot from one candidate and run the four diff passes.
    async fn refresh_from_candidate(&self, uri: &NodeAddress) -> Result<()> {
        let target = self.apply_nat_map(uri.clone());
        let text = self.connections.cluster_nodes(&target, self.sni()).await?;

        let tls = target.is_tls() || self.config.tls.is_some();
        let nodes = parse_cluster_nodes(&text, tls)?;

        *self.last_cluster_node.write() = Some(uri.clone());
        debug!("cluster nodes state got from {}:\n{}", target, text);

        let new_partitions = parse_partitions(&nodes, self.resolver.as_ref()).await;

        self.check_master_nodes_change(&new_partitions).await;
        self.check_slave_nodes_change(&new_partitions).await;
        self.check_slots_migration(&new_partitions);
        self.check_slots_change(&new_partitions);
        Ok(())
    }

    /// Masters pass: react to failovers on known masters and add masters
    /// that appeared. All additions run concurrently and are joined before
    /// the pass returns, whatever their individual outcomes.
    async fn check_master_nodes_change(&self, new_partitions: &[Arc<ClusterPartition>]) {
        let last_by_uri = self.last_partitions_by_uri();
        let mut added: Vec<Arc<ClusterPartition>> = Vec::new();
        let mut elected: HashSet<NodeAddress> = HashSet::new();

        for new_part in new_partitions {
            if new_part.slots_amount() == 0 {
                continue;
            }
            let Some(new_addr) = new_part.master_address() else {
                continue;
            };

            match last_by_uri.get(&new_addr) {
                Some(current_part) if new_part.is_master_fail() => {
                    // the server declared this master failed; follow each
                    // slot to whichever partition owns it now
                    for slot in current_part.slots().iter() {
                        let Some(owner) = find_partition_for_slot(new_partitions, slot) else {
                            warn!("unable to find partition with slot {}", slot);
                            continue;
                        };
                        let Some(new_uri) = owner.master_address() else {
                            continue;
                        };
                        let Some(old_uri) = current_part.master_address() else {
                            continue;
                        };
                        if new_uri == old_uri {
                            continue;
                        }

                        elected.insert(new_uri.clone());
                        current_part.set_master_address(new_uri.clone());
                        match self.change_master(slot, new_uri.clone()).await {
                            Ok(_) => self.connections.disconnect(&old_uri),
                            Err(e) => {
                                warn!(
                                    "failed to change master to {} for slot {}: {}",
                                    new_uri, slot, e
                                );
                                current_part.set_master_address(old_uri);
                            }
                        }
                    }
                }
                None if !new_part.is_master_fail() => added.push(Arc::clone(new_part)),
                _ => {}
            }
        }

        added.retain(|p| {
            p.master_address()
                .map(|a| !elected.contains(&a))
                .unwrap_or(false)
        });
        if added.is_empty() {
            return;
        }

        let additions = added.iter().map(|p| self.add_master_entry(Arc::clone(p)));
        for result in join_all(additions).await {
            if let Err(e) = result {
                debug!("master addition during tick failed: {}", e);
            }
        }
    }

    /// Slaves pass: membership diff first (clears stale failed state),
    /// then up/down transitions.
    async fn check_slave_nodes_change(&self, new_partitions: &[Arc<ClusterPartition>]) {
        let last_by_uri = self.last_partitions_by_uri();
        for new_part in new_partitions {
            let Some(addr) = new_part.master_address() else {
                continue;
            };
            let Some(current_part) = last_by_uri.get(&addr) else {
                continue;
            };
            let Some(first_slot) = current_part.first_slot() else {
                continue;
            };
            let Some(entry) = self.router.entry_for_slot(first_slot) else {
                continue;
            };

            let added = self.add_remove_slaves(&entry, current_part, new_part).await;
            self.up_down_slaves(&entry, current_part, new_part, &added);
        }
    }

    async fn add_remove_slaves(
        &self,
        entry: &Arc<MasterSlaveEntry>,
        current: &Arc<ClusterPartition>,
        new: &Arc<ClusterPartition>,
    ) -> HashSet<NodeAddress> {
        let current_slaves = current.slave_addresses();
        let new_slaves = new.slave_addresses();

        for uri in current_slaves.difference(&new_slaves) {
            current.remove_slave_address(uri);
            if entry.slave_down(uri, FreezeReason::Manager) {
                info!(
                    "slave {} removed for slot ranges: {}",
                    uri,
                    current.ranges_display()
                );
            }
        }

        let added: HashSet<NodeAddress> =
            new_slaves.difference(&current_slaves).cloned().collect();
        for uri in &added {
            if entry.get_member(uri).is_some() {
                current.add_slave_address(uri.clone());
                entry.slave_up(uri, FreezeReason::Manager);
                info!(
                    "slave: {} added for slot ranges: {}",
                    uri,
                    current.ranges_display()
                );
                continue;
            }

            match entry.add_slave(uri.clone(), false, self.sni()).await {
                Ok(()) => {
                    current.add_slave_address(uri.clone());
                    entry.slave_up(uri, FreezeReason::Manager);
                    info!(
                        "slave: {} added for slot ranges: {}",
                        uri,
                        current.ranges_display()
                    );
                }
                Err(e) => error!("can't add slave: {}: {}", uri, e),
            }
        }
        added
    }

    fn up_down_slaves(
        &self,
        entry: &Arc<MasterSlaveEntry>,
        current: &Arc<ClusterPartition>,
        new: &Arc<ClusterPartition>,
        added: &HashSet<NodeAddress>,
    ) {
        let current_failed = current.failed_slave_addresses();
        let new_failed = new.failed_slave_addresses();

        for uri in current_failed
            .iter()
            .filter(|u| !added.contains(u) && !new_failed.contains(u))
        {
            current.remove_failed_slave_address(uri);
            if entry.has_slave(uri) && entry.slave_up(uri, FreezeReason::Manager) {
                info!(
                    "slave: {} is up for slot ranges: {}",
                    uri,
                    current.ranges_display()
                );
            }
        }

        for uri in new_failed.iter().filter(|u| !current_failed.contains(u)) {
            current.add_failed_slave_address(uri.clone());
            if entry.slave_down(uri, FreezeReason::Manager) {
                self.connections.disconnect(uri);
                warn!(
                    "slave: {} has gone down for slot ranges: {}",
                    uri,
                    current.ranges_display()
                );
            }
        }
    }

    /// Migration pass: match partitions by node id and move slots between
    /// entries, then notify the subscription layer for every slot that
    /// changed ownership.
    fn check_slots_migration(&self, new_partitions: &[Arc<ClusterPartition>]) {
        let current_partitions = self.last_partitions();
        let node_entries: HashMap<String, Option<Arc<MasterSlaveEntry>>> = current_partitions
            .iter()
            .map(|p| {
                (
                    p.node_id().to_string(),
                    p.first_slot().and_then(|s| self.router.entry_for_slot(s)),
                )
            })
            .collect();

        let mut changed_slots: HashSet<u16> = HashSet::new();
        for current in &current_partitions {
            let Some(new_part) = new_partitions
                .iter()
                .find(|p| p.node_id() == current.node_id())
            else {
                continue;
            };
            let Some(Some(entry)) = node_entries.get(current.node_id()) else {
                continue;
            };

            let current_slots = current.slots();
            let new_slots = new_part.slots();

            let added = new_slots.difference(&current_slots);
            current.add_slots(&added);
            for slot in added.iter() {
                self.add_entry(slot, entry);
                self.slot_to_partition
                    .write()
                    .insert(slot, Arc::clone(current));
                changed_slots.insert(slot);
            }
            if !added.is_empty() {
                info!(
                    "{} slots added to {}",
                    added.len(),
                    display_master(current)
                );
            }

            let removed = current_slots.difference(&new_slots);
            current.remove_slots(&removed);
            for slot in removed.iter() {
                let owned_here = {
                    let mut map = self.slot_to_partition.write();
                    match map.get(&slot) {
                        Some(p) if Arc::ptr_eq(p, current) => {
                            map.remove(&slot);
                            true
                        }
                        _ => false,
                    }
                };
                if owned_here {
                    self.remove_entry(slot);
                    changed_slots.insert(slot);
                }
            }
            if !removed.is_empty() {
                info!(
                    "{} slots removed from {}",
                    removed.len(),
                    display_master(current)
                );
            }

            if !added.is_empty() || !removed.is_empty() {
                // keep the compact range representation in step with the bitset
                current.set_slot_ranges(new_part.slot_ranges());
            }
        }

        for slot in changed_slots {
            self.subscribe_service.reattach_pubsub(slot);
        }
    }

    /// Coverage pass: global cross-check for slots the per-node migration
    /// diff could miss (orphaned or newly introduced).
    fn check_slots_change(&self, new_partitions: &[Arc<ClusterPartition>]) {
        let new_total: usize = new_partitions.iter().map(|p| p.slots_amount()).sum();
        let last_len = self.slot_to_partition.read().len();
        if new_total == last_len && last_len == MAX_SLOT as usize {
            return;
        }

        let removed: Vec<u16> = self
            .slot_to_partition
            .read()
            .keys()
            .filter(|s| !new_partitions.iter().any(|p| p.has_slot(**s)))
            .copied()
            .collect();
        if !removed.is_empty() {
            info!("{} slots found to remove", removed.len());
        }
        for slot in removed {
            self.slot_to_partition.write().remove(&slot);
            self.remove_entry(slot);
        }

        let mut added = 0usize;
        for partition in new_partitions {
            let Some(addr) = partition.master_address() else {
                continue;
            };
            let Some(entry) = self.router.entry_for_addr(&addr) else {
                continue;
            };
            for slot in partition.slots().iter() {
                {
                    let mut map = self.slot_to_partition.write();
                    if map.contains_key(&slot) {
                        continue;
                    }
                    map.insert(slot, Arc::clone(partition));
                }
                self.add_entry(slot, &entry);
                added += 1;
            }
        }
        if added > 0 {
            info!("{} slots found to add", added);
        }
    }

    fn last_partitions_by_uri(&self) -> HashMap<NodeAddress, Arc<ClusterPartition>> {
        let map = self.slot_to_partition.read();
        let mut out = HashMap::new();
        for partition in map.values() {
            if let Some(addr) = partition.master_address() {
                out.entry(addr).or_insert_with(|| Arc::clone(partition));
            }
        }
        out
    }

    fn last_partitions(&self) -> Vec<Arc<ClusterPartition>> {
        let map = self.slot_to_partition.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for partition in map.values() {
            if seen.insert(partition.node_id().to_string()) {
                out.push(Arc::clone(partition));
            }
        }
        out
    }

    /// Partitions of the last accepted snapshot.
    pub fn current_partitions(&self) -> Vec<Arc<ClusterPartition>> {
        self.last_partitions()
    }

    /// Number of slots currently mapped.
    pub fn covered_slots(&self) -> usize {
        self.slot_to_partition.read().len()
    }

    async fn cleanup_after_failed_start(&self) {
        self.shutdown_latch.close_and_wait().await;
        self.connections.close_all();
        let entries = self.router.entries();
        join_all(entries.iter().map(|e| e.shutdown())).await;
    }

    #[cfg(test)]
    pub(crate) fn partition_for_slot(&self, slot: u16) -> Option<Arc<ClusterPartition>> {
        self.slot_to_partition.read().get(&slot).cloned()
    }
}

#[async_trait]
impl ConnectionManager for ClusterManager {
    fn calc_slot(&self, key: &[u8]) -> u16 {
        calc_slot(key)
    }

    fn is_cluster_mode(&self) -> bool {
        true
    }

    fn entry_for_slot(&self, slot: u16) -> Option<Arc<MasterSlaveEntry>> {
        self.router.entry_for_slot(slot)
    }

    fn entry_for_client(&self, client: &ClientHandle) -> Option<Arc<MasterSlaveEntry>> {
        self.router.entry_for_client(client)
    }

    fn entry_for_addr(&self, addr: &NodeAddress) -> Option<Arc<MasterSlaveEntry>> {
        self.router.entry_for_addr(addr)
    }

    fn entry_set(&self) -> Vec<Arc<MasterSlaveEntry>> {
        self.router.entries()
    }

    fn apply_nat_map(&self, addr: NodeAddress) -> NodeAddress {
        self.config.nat_mapper.map(addr)
    }

    fn last_cluster_node(&self) -> Option<NodeAddress> {
        self.last_cluster_node.read().clone()
    }

    async fn change_master(&self, slot: u16, address: NodeAddress) -> Result<ClientHandle> {
        let entry = self
            .router
            .entry_for_slot(slot)
            .ok_or(ClusterError::NoEntryForSlot(slot))?;
        let old_client = entry.master_client();

        let mapped = self.apply_nat_map(address);
        let new_client = entry.change_master(mapped, self.sni()).await?;

        self.router
            .rebind_client(&old_client, new_client.clone(), Arc::clone(&entry));
        info!(
            "slot {} master {} changed to {}",
            slot,
            old_client.addr(),
            new_client.addr()
        );
        Ok(new_client)
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.monitor_task.lock().take() {
            handle.abort();
        }
        self.shutdown_latch.close_and_wait().await;
        self.connections.close_all();

        let entries = self.router.entries();
        join_all(entries.iter().map(|e| e.shutdown())).await;
        info!("cluster topology manager stopped");
    }
}

/// The partition owning a slot in the new snapshot. When a failed master
/// still claims its old slots alongside its successor, prefer the live
/// claimer.
fn find_partition_for_slot(
    partitions: &[Arc<ClusterPartition>],
    slot: u16,
) -> Option<Arc<ClusterPartition>> {
    partitions
        .iter()
        .find(|p| !p.is_master_fail() && p.has_slot(slot))
        .or_else(|| partitions.iter().find(|p| p.has_slot(slot)))
        .cloned()
}

fn display_addrs(addrs: &HashSet<NodeAddress>) -> Vec<String> {
    addrs.iter().map(|a| a.to_string()).collect()
}

fn display_master(partition: &ClusterPartition) -> String {
    partition
        .master_address()
        .map(|a| a.to_string())
        .unwrap_or_else(|| partition.node_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::pool::{ConnectionPool, NodeRole, PoolMember};
    use crate::cluster::partition::SlotRange;
    use crate::utils::ConnectionError;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    // ----- scripted control plane -----

    #[derive(Default)]
    struct ScriptedControlPlane {
        snapshot: Mutex<String>,
        dead: Mutex<HashSet<NodeAddress>>,
        disconnects: Mutex<Vec<NodeAddress>>,
        closed: AtomicBool,
    }

    impl ScriptedControlPlane {
        fn new(snapshot: &str) -> Arc<Self> {
            let plane = Self::default();
            *plane.snapshot.lock() = snapshot.to_string();
            Arc::new(plane)
        }

        fn set_snapshot(&self, snapshot: &str) {
            *self.snapshot.lock() = snapshot.to_string();
        }

        fn kill(&self, addr: &NodeAddress) {
            self.dead.lock().insert(addr.clone());
        }

        fn disconnected(&self, addr: &NodeAddress) -> bool {
            self.disconnects.lock().contains(addr)
        }

        fn refused(&self, addr: &NodeAddress) -> Result<()> {
            if self.dead.lock().contains(addr) {
                return Err(ConnectionError::ConnectFailed {
                    addr: addr.to_string(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                }
                .into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ControlPlane for ScriptedControlPlane {
        async fn ensure_node(&self, addr: &NodeAddress, _sni: Option<&str>) -> Result<()> {
            self.refused(addr)
        }

        async fn cluster_nodes(&self, addr: &NodeAddress, _sni: Option<&str>) -> Result<String> {
            self.refused(addr)?;
            Ok(self.snapshot.lock().clone())
        }

        fn disconnect(&self, addr: &NodeAddress) {
            self.disconnects.lock().push(addr.clone());
        }

        fn close_all(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    // ----- recording pools -----

    #[derive(Default)]
    struct CallLog(Mutex<Vec<String>>);

    impl CallLog {
        fn push(&self, call: String) {
            self.0.lock().push(call);
        }

        fn count_of(&self, prefix: &str) -> usize {
            self.0
                .lock()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }

        fn len(&self) -> usize {
            self.0.lock().len()
        }
    }

    struct RecordingPool {
        master_addr: RwLock<NodeAddress>,
        slaves: RwLock<HashSet<NodeAddress>>,
        frozen: RwLock<HashSet<NodeAddress>>,
        log: Arc<CallLog>,
    }

    #[async_trait]
    impl ConnectionPool for RecordingPool {
        async fn setup_master(
            &self,
            _sni: Option<&str>,
        ) -> std::result::Result<ClientHandle, ConnectionError> {
            let addr = self.master_addr.read().clone();
            self.log.push(format!("setup_master {addr}"));
            Ok(ClientHandle::new(addr))
        }

        async fn init_slave_balancer(
            &self,
            failed: &HashSet<NodeAddress>,
            _sni: Option<&str>,
        ) -> std::result::Result<(), ConnectionError> {
            self.log
                .push(format!("init_slave_balancer failed={}", failed.len()));
            for addr in failed {
                self.frozen.write().insert(addr.clone());
            }
            Ok(())
        }

        async fn add_slave(
            &self,
            addr: NodeAddress,
            _readonly: bool,
            _role: NodeRole,
            _sni: Option<&str>,
        ) -> std::result::Result<(), ConnectionError> {
            self.log.push(format!("add_slave {addr}"));
            self.slaves.write().insert(addr);
            Ok(())
        }

        async fn change_master(
            &self,
            addr: NodeAddress,
            _sni: Option<&str>,
        ) -> std::result::Result<ClientHandle, ConnectionError> {
            self.log.push(format!("change_master {addr}"));
            *self.master_addr.write() = addr.clone();
            self.slaves.write().remove(&addr);
            Ok(ClientHandle::new(addr))
        }

        fn has_slave(&self, addr: &NodeAddress) -> bool {
            self.slaves.read().contains(addr)
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
            members.extend(self.slaves.read().iter().map(|addr| PoolMember {
                address: addr.clone(),
                role: NodeRole::Slave,
            }));
            members
        }

        fn slave_up(&self, addr: &NodeAddress, reason: FreezeReason) -> bool {
            self.log.push(format!("slave_up {addr} {reason:?}"));
            self.frozen.write().remove(addr)
        }

        fn slave_down(&self, addr: &NodeAddress, reason: FreezeReason) -> bool {
            self.log.push(format!("slave_down {addr} {reason:?}"));
            if self.slaves.read().contains(addr) && !self.frozen.read().contains(addr) {
                self.frozen.write().insert(addr.clone());
                true
            } else {
                false
            }
        }

        fn master_down(&self) {
            self.log
                .push(format!("master_down {}", self.master_addr.read()));
        }

        fn node_down(&self, member: &PoolMember) {
            self.log.push(format!("node_down {}", member.address));
        }

        async fn shutdown(&self) {
            self.log
                .push(format!("shutdown {}", self.master_addr.read()));
        }
    }

    struct RecordingPoolFactory {
        log: Arc<CallLog>,
    }

    impl PoolFactory for RecordingPoolFactory {
        fn create(
            &self,
            master: NodeAddress,
            slaves: HashSet<NodeAddress>,
            readonly_slaves: bool,
        ) -> Arc<dyn ConnectionPool> {
            self.log.push(format!(
                "create {master} slaves={} readonly={readonly_slaves}",
                slaves.len()
            ));
            Arc::new(RecordingPool {
                master_addr: RwLock::new(master),
                slaves: RwLock::new(slaves),
                frozen: RwLock::new(HashSet::new()),
                log: Arc::clone(&self.log),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSubscribe {
        removed: Mutex<usize>,
        reattached: Mutex<Vec<u16>>,
    }

    impl SubscribeService for RecordingSubscribe {
        fn remove(&self, _entry: &Arc<MasterSlaveEntry>) {
            *self.removed.lock() += 1;
        }

        fn reattach_pubsub(&self, slot: u16) {
            self.reattached.lock().push(slot);
        }
    }

    // ----- fixtures -----

    const THREE_MASTERS: &str = "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-5460
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16383
";

    fn addr(s: &str) -> NodeAddress {
        NodeAddress::parse(s).unwrap()
    }

    struct Harness {
        manager: Arc<ClusterManager>,
        control: Arc<ScriptedControlPlane>,
        log: Arc<CallLog>,
        subscribe: Arc<RecordingSubscribe>,
    }

    async fn start(snapshot: &str) -> Harness {
        try_start(snapshot, vec![addr("10.0.0.1:7000")], true)
            .await
            .unwrap()
    }

    async fn try_start(
        snapshot: &str,
        seeds: Vec<NodeAddress>,
        check_coverage: bool,
    ) -> Result<Harness> {
        let control = ScriptedControlPlane::new(snapshot);
        let log = Arc::new(CallLog::default());
        let subscribe = Arc::new(RecordingSubscribe::default());
        let config = ClusterConfig::new(seeds)
            .scan_interval(Duration::from_secs(3600))
            .check_slots_coverage(check_coverage);

        let manager = ClusterManager::connect_with(
            config,
            Arc::clone(&control) as Arc<dyn ControlPlane>,
            Arc::new(RecordingPoolFactory {
                log: Arc::clone(&log),
            }),
            Arc::new(DnsResolver),
            Arc::clone(&subscribe) as Arc<dyn SubscribeService>,
        )
        .await?;

        Ok(Harness {
            manager,
            control,
            log,
            subscribe,
        })
    }

    fn master_of_slot(manager: &ClusterManager, slot: u16) -> String {
        manager
            .entry_for_slot(slot)
            .unwrap()
            .master_client()
            .addr()
            .to_string()
    }

    // ----- scenarios -----

    #[tokio::test]
    async fn cold_start_three_masters() {
        let h = start(THREE_MASTERS).await;
        let m = &h.manager;

        assert_eq!(master_of_slot(m, 0), "10.0.0.1:7000");
        assert_eq!(master_of_slot(m, 5460), "10.0.0.1:7000");
        assert_eq!(master_of_slot(m, 5461), "10.0.0.2:7000");
        assert_eq!(master_of_slot(m, 16383), "10.0.0.3:7000");

        assert_eq!(m.covered_slots(), 16384);
        assert_eq!(m.entry_set().len(), 3);
        assert_eq!(h.log.count_of("create"), 3);
        assert_eq!(h.log.count_of("setup_master"), 3);

        let a_entry = m.entry_for_slot(0).unwrap();
        assert_eq!(a_entry.ref_count(), 5461);

        assert_eq!(
            m.last_cluster_node().unwrap().to_string(),
            "10.0.0.1:7000"
        );
    }

    #[tokio::test]
    async fn failover_moves_slots_to_elected_master() {
        let h = start(THREE_MASTERS).await;
        let m = &h.manager;
        let entry_before = m.entry_for_slot(0).unwrap();

        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master,fail - 0 0 1 disconnected 0-5460
a4 10.0.0.4:7000@17000 master - 0 0 5 connected 0-5460
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16383
",
        );
        assert!(m.check_cluster_state().await);

        // the entry survives with a new master client on every slot
        assert_eq!(master_of_slot(m, 0), "10.0.0.4:7000");
        assert_eq!(master_of_slot(m, 5460), "10.0.0.4:7000");
        assert!(Arc::ptr_eq(&m.entry_for_slot(0).unwrap(), &entry_before));

        // diff state follows the new address
        assert_eq!(
            m.partition_for_slot(0).unwrap().master_address().unwrap(),
            addr("10.0.0.4:7000")
        );
        assert_eq!(
            m.partition_for_slot(5460)
                .unwrap()
                .master_address()
                .unwrap(),
            addr("10.0.0.4:7000")
        );

        // one pool-level master swap serves the whole range
        assert_eq!(h.log.count_of("change_master 10.0.0.4:7000"), 1);
        // the elected master is not double-added
        assert_eq!(h.log.count_of("create 10.0.0.4:7000"), 0);
        // the failed master's control connection is dropped
        assert!(h.control.disconnected(&addr("10.0.0.1:7000")));

        // reverse lookups follow the rebind
        assert!(m.entry_for_addr(&addr("10.0.0.4:7000")).is_some());
        assert!(m.entry_for_addr(&addr("10.0.0.1:7000")).is_none());
        assert_eq!(m.entry_set().len(), 3);
    }

    #[tokio::test]
    async fn simultaneous_double_failover_converges_in_one_tick() {
        let h = start(THREE_MASTERS).await;
        let m = &h.manager;

        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master,fail - 0 0 1 disconnected 0-5460
b2 10.0.0.2:7000@17000 master,fail - 0 0 2 disconnected 5461-10922
a4 10.0.0.4:7000@17000 master - 0 0 5 connected 0-5460
b5 10.0.0.5:7000@17000 master - 0 0 6 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16383
",
        );
        assert!(m.check_cluster_state().await);

        assert_eq!(master_of_slot(m, 0), "10.0.0.4:7000");
        assert_eq!(master_of_slot(m, 6000), "10.0.0.5:7000");
        assert_eq!(master_of_slot(m, 16383), "10.0.0.3:7000");
        assert_eq!(h.log.count_of("change_master"), 2);
        assert_eq!(m.entry_set().len(), 3);
    }

    #[tokio::test]
    async fn slave_churn_add_then_fail() {
        let h = start("a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-16383\n").await;
        let m = &h.manager;
        let slave = addr("10.0.0.9:7001");

        // tick 1: a new slave appears
        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-16383
s1 10.0.0.9:7001@17001 slave a1 0 0 1 connected
",
        );
        assert!(m.check_cluster_state().await);
        assert_eq!(h.log.count_of("add_slave 10.0.0.9:7001"), 1);
        assert!(m
            .partition_for_slot(0)
            .unwrap()
            .slave_addresses()
            .contains(&slave));

        // tick 2: the same slave is flagged failed
        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-16383
s1 10.0.0.9:7001@17001 slave,fail a1 0 0 1 disconnected
",
        );
        assert!(m.check_cluster_state().await);
        assert_eq!(h.log.count_of("slave_down 10.0.0.9:7001 Manager"), 1);
        assert!(h.control.disconnected(&slave));
        assert!(m
            .partition_for_slot(0)
            .unwrap()
            .failed_slave_addresses()
            .contains(&slave));

        // tick 3: the slave recovers
        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-16383
s1 10.0.0.9:7001@17001 slave a1 0 0 1 connected
",
        );
        assert!(m.check_cluster_state().await);
        // once after add_slave in tick 1, once for the recovery now
        assert_eq!(h.log.count_of("slave_up 10.0.0.9:7001 Manager"), 2);
        assert!(m
            .partition_for_slot(0)
            .unwrap()
            .failed_slave_addresses()
            .is_empty());
    }

    #[tokio::test]
    async fn slave_moves_between_masters_without_new_entries() {
        let h = start(
            "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-8191
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 8192-16383
s1 10.0.0.9:7001@17001 slave a1 0 0 1 connected
",
        )
        .await;
        let m = &h.manager;
        let slave = addr("10.0.0.9:7001");
        let creates_before = h.log.count_of("create");

        // same snapshot except s1 now replicates b2
        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-8191
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 8192-16383
s1 10.0.0.9:7001@17001 slave b2 0 0 1 connected
",
        );
        assert!(m.check_cluster_state().await);

        // no entry was created or torn down, the slave just moved
        assert_eq!(h.log.count_of("create"), creates_before);
        assert_eq!(h.log.count_of("setup_master"), creates_before);
        assert_eq!(h.log.count_of("slave_down 10.0.0.9:7001 Manager"), 1);
        assert_eq!(h.log.count_of("add_slave 10.0.0.9:7001"), 1);

        assert!(!m
            .partition_for_slot(0)
            .unwrap()
            .slave_addresses()
            .contains(&slave));
        assert!(m
            .partition_for_slot(8192)
            .unwrap()
            .slave_addresses()
            .contains(&slave));
    }

    #[tokio::test]
    async fn slot_migration_without_failover() {
        let h = start(THREE_MASTERS).await;
        let m = &h.manager;

        let a_entry = m.entry_for_slot(0).unwrap();
        let c_entry = m.entry_for_slot(16383).unwrap();

        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-5000
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 5001-5460 10923-16383
",
        );
        assert!(m.check_cluster_state().await);

        assert_eq!(master_of_slot(m, 5000), "10.0.0.1:7000");
        assert_eq!(master_of_slot(m, 5001), "10.0.0.3:7000");
        assert_eq!(master_of_slot(m, 5460), "10.0.0.3:7000");
        assert!(Arc::ptr_eq(&m.entry_for_slot(5001).unwrap(), &c_entry));

        // refcounts track slot ownership exactly
        assert_eq!(a_entry.ref_count(), 5001);
        assert_eq!(c_entry.ref_count(), 5461 + 460);

        // compact ranges rewritten wholesale
        let a_part = m.partition_for_slot(0).unwrap();
        assert_eq!(a_part.slot_ranges(), vec![SlotRange::new(0, 5000)]);

        // pubsub reattached exactly once per moved slot
        let reattached = h.subscribe.reattached.lock().clone();
        assert_eq!(reattached.len(), 460);
        assert!(reattached.contains(&5001));
        assert!(reattached.contains(&5460));

        // every routed slot is claimed by its mapped partition
        for slot in [0u16, 5000, 5001, 5460, 10000, 16383] {
            assert!(m.partition_for_slot(slot).unwrap().has_slot(slot));
        }
    }

    #[tokio::test]
    async fn new_master_added_at_runtime() {
        let h = start(THREE_MASTERS).await;
        let m = &h.manager;
        let c_entry = m.entry_for_slot(16383).unwrap();

        h.control.set_snapshot(
            "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-5460
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16000
d4 10.0.0.4:7000@17000 master - 0 0 4 connected 16001-16383
",
        );
        assert!(m.check_cluster_state().await);

        assert_eq!(h.log.count_of("create 10.0.0.4:7000"), 1);
        assert_eq!(master_of_slot(m, 16001), "10.0.0.4:7000");
        assert_eq!(master_of_slot(m, 16000), "10.0.0.3:7000");
        assert_eq!(m.entry_set().len(), 4);
        assert_eq!(c_entry.ref_count(), 16000 - 10923 + 1);
        assert_eq!(m.covered_slots(), 16384);
    }

    #[tokio::test]
    async fn unchanged_snapshot_is_idempotent() {
        let snapshot = "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-8191
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 8192-16383
s1 10.0.0.9:7001@17001 slave a1 0 0 1 connected
";
        let h = start(snapshot).await;
        let m = &h.manager;

        let entry_before = m.entry_for_slot(0).unwrap();
        let calls_before = h.log.len();

        assert!(m.check_cluster_state().await);
        assert!(m.check_cluster_state().await);

        // no router mutations, no pool lifecycle calls
        assert_eq!(h.log.len(), calls_before);
        assert!(Arc::ptr_eq(&m.entry_for_slot(0).unwrap(), &entry_before));
        assert_eq!(h.subscribe.reattached.lock().len(), 0);
    }

    #[tokio::test]
    async fn all_seeds_unreachable_fails_startup() {
        let seeds = vec![addr("10.0.0.51:7000"), addr("10.0.0.52:7000")];
        let control = ScriptedControlPlane::new(THREE_MASTERS);
        for seed in &seeds {
            control.kill(seed);
        }
        let log = Arc::new(CallLog::default());

        let result = ClusterManager::connect_with(
            ClusterConfig::new(seeds),
            Arc::clone(&control) as Arc<dyn ControlPlane>,
            Arc::new(RecordingPoolFactory {
                log: Arc::clone(&log),
            }),
            Arc::new(DnsResolver),
            Arc::new(NoopSubscribeService),
        )
        .await;

        let err = result.err().unwrap();
        let message = err.to_string();
        assert!(message.contains("10.0.0.51:7000"));
        assert!(message.contains("10.0.0.52:7000"));
        assert!(matches!(err, ClusterError::NoSeedsAvailable { .. }));

        // no pools were created or leaked, connections are closed
        assert_eq!(log.len(), 0);
        assert!(control.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn strict_coverage_shortfall_fails_startup() {
        let partial = "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-5460
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16382
";
        let err = try_start(partial, vec![addr("10.0.0.1:7000")], true)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ClusterError::Coverage {
                available: 16383,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn lax_coverage_starts_and_ticks_continue() {
        let partial = "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-5460
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16382
";
        let h = try_start(partial, vec![addr("10.0.0.1:7000")], false)
            .await
            .unwrap();
        assert_eq!(h.manager.covered_slots(), 16383);

        // at runtime a shortfall is not an error
        assert!(h.manager.check_cluster_state().await);
        assert_eq!(h.manager.covered_slots(), 16383);
        assert!(h.manager.entry_for_slot(16383).is_none());
    }

    #[tokio::test]
    async fn failed_master_in_bootstrap_is_annotated() {
        let snapshot = "\
a1 10.0.0.1:7000@17000 master,fail - 0 0 1 disconnected 0-16383
";
        let err = try_start(snapshot, vec![addr("10.0.0.1:7000")], true)
            .await
            .err()
            .unwrap();
        match err {
            ClusterError::FailedMasters { masters, .. } => {
                assert_eq!(masters, vec!["10.0.0.1:7000".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn shutdown_drains_latch_and_stops_ticks() {
        let h = start(THREE_MASTERS).await;
        let m = &h.manager;

        m.shutdown().await;
        assert!(h.control.closed.load(Ordering::SeqCst));
        assert_eq!(h.log.count_of("shutdown"), 3);

        // a tick started after shutdown aborts silently at the latch
        assert!(!m.check_cluster_state().await);
    }

    #[tokio::test]
    async fn entry_teardown_happens_once_per_entry() {
        let h = start(THREE_MASTERS).await;
        let m = &h.manager;

        // shrink the cluster to a single master
        h.control.set_snapshot(
            "a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-16383\n",
        );
        assert!(m.check_cluster_state().await);
        tokio::task::yield_now().await;

        assert_eq!(m.entry_set().len(), 1);
        assert_eq!(master_of_slot(m, 16383), "10.0.0.1:7000");
        assert_eq!(h.log.count_of("master_down 10.0.0.2:7000"), 1);
        assert_eq!(h.log.count_of("master_down 10.0.0.3:7000"), 1);
        assert_eq!(*h.subscribe.removed.lock(), 2);

        let a_entry = m.entry_for_slot(0).unwrap();
        assert_eq!(a_entry.ref_count(), 16384);
    }
}
