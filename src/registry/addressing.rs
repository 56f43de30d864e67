//! Auxiliary registry tables: address bindings, carriers, multicast groups and
//! the per-slot resource usage snapshot.
//!
//! Each table only knows how to add, look up and purge entries for a node id.
//! The registry composes them and drives the purge on unregistration.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

use super::node_id::NodeId;

/// Address → node id bindings for one radio technology.
#[derive(Debug, Default)]
pub struct AddressTable {
    bindings: HashMap<Ipv4Addr, NodeId>,
}

impl AddressTable {
    /// Bind an address, returning the node it was previously bound to.
    pub fn bind(&mut self, address: Ipv4Addr, id: NodeId) -> Option<NodeId> {
        self.bindings.insert(address, id)
    }

    pub fn resolve(&self, address: Ipv4Addr) -> Option<NodeId> {
        self.bindings.get(&address).copied()
    }

    pub fn unbind(&mut self, address: Ipv4Addr) -> Option<NodeId> {
        self.bindings.remove(&address)
    }

    /// Remove every binding pointing at `id`. Returns how many were removed.
    pub fn purge(&mut self, id: NodeId) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, bound| *bound != id);
        before - self.bindings.len()
    }

    pub fn references(&self, id: NodeId) -> bool {
        self.bindings.values().any(|bound| *bound == id)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

/// Carrier frequency identifier (centre frequency in MHz).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct CarrierId(pub u32);

impl fmt::Display for CarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz", self.0)
    }
}

/// Multicast group memberships.
#[derive(Debug, Default)]
pub struct MulticastGroups {
    groups: HashMap<u32, BTreeSet<NodeId>>,
}

impl MulticastGroups {
    pub fn join(&mut self, group: u32, id: NodeId) -> bool {
        self.groups.entry(group).or_default().insert(id)
    }

    pub fn leave(&mut self, group: u32, id: NodeId) -> bool {
        let Some(members) = self.groups.get_mut(&group) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            self.groups.remove(&group);
        }
        removed
    }

    pub fn members(&self, group: u32) -> Vec<NodeId> {
        self.groups.get(&group).map(|m| m.iter().copied().collect()).unwrap_or_default()
    }

    /// Drop `id` from every group; empty groups are removed.
    pub fn purge(&mut self, id: NodeId) -> usize {
        let mut removed = 0;
        self.groups.retain(|_, members| {
            if members.remove(&id) {
                removed += 1;
            }
            !members.is_empty()
        });
        removed
    }

    pub fn references(&self, id: NodeId) -> bool {
        self.groups.values().any(|members| members.contains(&id))
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Resource blocks used per node in the current and the previous slot.
///
/// Interference accounting reads the previous slot while the current one is
/// still being filled, so both have to forget a node when it leaves.
#[derive(Debug, Default)]
pub struct UsageSnapshot {
    current: HashMap<NodeId, u32>,
    previous: HashMap<NodeId, u32>,
}

impl UsageSnapshot {
    pub fn record(&mut self, id: NodeId, blocks: u32) {
        *self.current.entry(id).or_insert(0) += blocks;
    }

    /// Close the current slot: it becomes the previous one.
    pub fn advance(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    /// `(current, previous)` block counts for a node.
    pub fn usage(&self, id: NodeId) -> (u32, u32) {
        (
            self.current.get(&id).copied().unwrap_or(0),
            self.previous.get(&id).copied().unwrap_or(0),
        )
    }

    pub fn purge(&mut self, id: NodeId) -> bool {
        let current = self.current.remove(&id).is_some();
        let previous = self.previous.remove(&id).is_some();
        current || previous
    }

    pub fn references(&self, id: NodeId) -> bool {
        self.current.contains_key(&id) || self.previous.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.previous.clear();
    }
}
