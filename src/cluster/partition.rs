//! Canonical cluster partitions
//!
//! One [`ClusterPartition`] describes a logical master: its address, its
//! replicas, and the slots it owns. Partitions come out of the snapshot
//! parser and are diffed by the topology monitor, which mutates the fields
//! behind a lock while a tick is running.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::address::NodeAddress;
use super::slot::MAX_SLOT;

/// Closed slot interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end && end < MAX_SLOT);
        Self { start, end }
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

const SLOT_WORDS: usize = MAX_SLOT as usize / 64;

/// Fixed bitset over the 16384 hash slots.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotSet {
    words: [u64; SLOT_WORDS],
}

impl Default for SlotSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotSet {
    pub fn new() -> Self {
        Self {
            words: [0; SLOT_WORDS],
        }
    }

    pub fn from_ranges(ranges: &[SlotRange]) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert_range(range);
        }
        set
    }

    pub fn insert(&mut self, slot: u16) {
        self.words[slot as usize / 64] |= 1u64 << (slot % 64);
    }

    pub fn insert_range(&mut self, range: &SlotRange) {
        for slot in range.start..=range.end {
            self.insert(slot);
        }
    }

    pub fn remove(&mut self, slot: u16) {
        self.words[slot as usize / 64] &= !(1u64 << (slot % 64));
    }

    pub fn contains(&self, slot: u16) -> bool {
        self.words[slot as usize / 64] & (1u64 << (slot % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn first(&self) -> Option<u16> {
        for (i, &word) in self.words.iter().enumerate() {
            if word != 0 {
                return Some((i * 64 + word.trailing_zeros() as usize) as u16);
            }
        }
        None
    }

    /// Slots present in `self` but not in `other`.
    pub fn difference(&self, other: &SlotSet) -> SlotSet {
        let mut out = SlotSet::new();
        for (i, (a, b)) in self.words.iter().zip(other.words.iter()).enumerate() {
            out.words[i] = a & !b;
        }
        out
    }

    pub fn union_with(&mut self, other: &SlotSet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= b;
        }
    }

    pub fn subtract(&mut self, other: &SlotSet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= !b;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..MAX_SLOT).filter(|&s| self.contains(s))
    }
}

impl fmt::Debug for SlotSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotSet({} slots)", self.len())
    }
}

/// Partition type while a snapshot is being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Master,
    Slave,
}

struct PartitionState {
    ptype: PartitionType,
    master_address: Option<NodeAddress>,
    slave_addresses: HashSet<NodeAddress>,
    failed_slaves: HashSet<NodeAddress>,
    slots: SlotSet,
    slot_ranges: Vec<SlotRange>,
}

/// One logical master and its replica set.
pub struct ClusterPartition {
    node_id: String,
    master_fail: AtomicBool,
    state: RwLock<PartitionState>,
}

impl ClusterPartition {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            master_fail: AtomicBool::new(false),
            state: RwLock::new(PartitionState {
                ptype: PartitionType::Master,
                master_address: None,
                slave_addresses: HashSet::new(),
                failed_slaves: HashSet::new(),
                slots: SlotSet::new(),
                slot_ranges: Vec::new(),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn partition_type(&self) -> PartitionType {
        self.state.read().ptype
    }

    pub fn set_type(&self, ptype: PartitionType) {
        self.state.write().ptype = ptype;
    }

    pub fn is_master_fail(&self) -> bool {
        self.master_fail.load(Ordering::Acquire)
    }

    pub fn set_master_fail(&self, fail: bool) {
        self.master_fail.store(fail, Ordering::Release);
    }

    pub fn master_address(&self) -> Option<NodeAddress> {
        self.state.read().master_address.clone()
    }

    pub fn set_master_address(&self, address: NodeAddress) {
        self.state.write().master_address = Some(address);
    }

    pub fn slave_addresses(&self) -> HashSet<NodeAddress> {
        self.state.read().slave_addresses.clone()
    }

    pub fn failed_slave_addresses(&self) -> HashSet<NodeAddress> {
        self.state.read().failed_slaves.clone()
    }

    pub fn add_slave_address(&self, address: NodeAddress) {
        self.state.write().slave_addresses.insert(address);
    }

    pub fn remove_slave_address(&self, address: &NodeAddress) {
        let mut state = self.state.write();
        state.slave_addresses.remove(address);
        state.failed_slaves.remove(address);
    }

    pub fn add_failed_slave_address(&self, address: NodeAddress) {
        self.state.write().failed_slaves.insert(address);
    }

    pub fn remove_failed_slave_address(&self, address: &NodeAddress) {
        self.state.write().failed_slaves.remove(address);
    }

    pub fn slots(&self) -> SlotSet {
        self.state.read().slots.clone()
    }

    pub fn has_slot(&self, slot: u16) -> bool {
        self.state.read().slots.contains(slot)
    }

    pub fn slots_amount(&self) -> usize {
        self.state.read().slots.len()
    }

    pub fn first_slot(&self) -> Option<u16> {
        self.state.read().slots.first()
    }

    pub fn add_slot_ranges(&self, ranges: &[SlotRange]) {
        let mut state = self.state.write();
        for range in ranges {
            state.slots.insert_range(range);
            state.slot_ranges.push(*range);
        }
    }

    pub fn add_slots(&self, slots: &SlotSet) {
        self.state.write().slots.union_with(slots);
    }

    pub fn remove_slots(&self, slots: &SlotSet) {
        self.state.write().slots.subtract(slots);
    }

    pub fn slot_ranges(&self) -> Vec<SlotRange> {
        self.state.read().slot_ranges.clone()
    }

    /// Replace the compact range representation wholesale, keeping it in
    /// step with the slot bitset after a migration diff.
    pub fn set_slot_ranges(&self, ranges: Vec<SlotRange>) {
        self.state.write().slot_ranges = ranges;
    }

    /// Render slot ranges for log messages.
    pub fn ranges_display(&self) -> String {
        let ranges = self.slot_ranges();
        let parts: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        format!("[{}]", parts.join(", "))
    }
}

impl fmt::Debug for ClusterPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ClusterPartition")
            .field("node_id", &self.node_id)
            .field("type", &state.ptype)
            .field("master_address", &state.master_address)
            .field("slaves", &state.slave_addresses.len())
            .field("slots", &state.slots.len())
            .field("master_fail", &self.is_master_fail())
            .finish()
    }
}
