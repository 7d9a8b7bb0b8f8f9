//! Slot routing table
//!
//! `entry_for_slot` sits on the request hot path: a single atomic load on
//! a fixed 16384-cell array, no locks. All mutation goes through per-cell
//! atomic swaps driven by the registry; the client index supports reverse
//! lookup for redirection handling.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;

use crate::client::pool::ClientHandle;

use super::address::NodeAddress;
use super::entry::MasterSlaveEntry;
use super::slot::MAX_SLOT;

pub struct SlotRouter {
    cells: Box<[ArcSwapOption<MasterSlaveEntry>]>,
    client_index: RwLock<HashMap<ClientHandle, Arc<MasterSlaveEntry>>>,
}

impl Default for SlotRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotRouter {
    pub fn new() -> Self {
        let cells: Vec<ArcSwapOption<MasterSlaveEntry>> = (0..MAX_SLOT)
            .map(|_| ArcSwapOption::const_empty())
            .collect();
        Self {
            cells: cells.into_boxed_slice(),
            client_index: RwLock::new(HashMap::new()),
        }
    }

    /// Hot-path lookup: one atomic load.
    pub fn entry_for_slot(&self, slot: u16) -> Option<Arc<MasterSlaveEntry>> {
        self.cells[slot as usize].load_full()
    }

    /// Reverse lookup by client handle, falling back to a scan of entries
    /// that own the client's address as a slave.
    pub fn entry_for_client(&self, client: &ClientHandle) -> Option<Arc<MasterSlaveEntry>> {
        if let Some(entry) = self.client_index.read().get(client) {
            return Some(Arc::clone(entry));
        }
        self.entries()
            .into_iter()
            .find(|entry| entry.has_slave(client.addr()))
    }

    /// Lookup by address: matches the master address or any slave.
    pub fn entry_for_addr(&self, addr: &NodeAddress) -> Option<Arc<MasterSlaveEntry>> {
        self.entries()
            .into_iter()
            .find(|entry| entry.master_client().addr() == addr || entry.has_slave(addr))
    }

    /// All registered entries. One binding exists per entry, so the index
    /// values are already distinct.
    pub fn entries(&self) -> Vec<Arc<MasterSlaveEntry>> {
        self.client_index.read().values().cloned().collect()
    }

    /// Atomically replace a cell, returning the previous occupant.
    pub(crate) fn swap(
        &self,
        slot: u16,
        entry: Option<Arc<MasterSlaveEntry>>,
    ) -> Option<Arc<MasterSlaveEntry>> {
        self.cells[slot as usize].swap(entry)
    }

    pub(crate) fn bind_client(&self, client: ClientHandle, entry: Arc<MasterSlaveEntry>) {
        self.client_index.write().insert(client, entry);
    }

    pub(crate) fn unbind_client(&self, client: &ClientHandle) {
        self.client_index.write().remove(client);
    }

    pub(crate) fn rebind_client(
        &self,
        old: &ClientHandle,
        new: ClientHandle,
        entry: Arc<MasterSlaveEntry>,
    ) {
        let mut index = self.client_index.write();
        index.remove(old);
        index.insert(new, entry);
    }
}
