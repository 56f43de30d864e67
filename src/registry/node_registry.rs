//! The node registry: one owned directory of every node in the network.
//!
//! All cross-node relationships live here (serving assignments, dual
//! connectivity anchors, forwarding entries, address bindings, carriers,
//! multicast groups, resource usage). Access goes through methods only, so
//! the table can later be made thread-safe or sharded without touching callers.
//!
//! Lifecycle: [`NodeRegistry::new`] at process start, [`NodeRegistry::teardown`]
//! at shutdown.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use crate::error::RegistryError;

use super::addressing::{AddressTable, CarrierId, MulticastGroups, UsageSnapshot};
use super::node_id::{Leg, ModuleRef, NodeId, NodeKind, PerLeg};

/// Per-node registration record.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Native technology of the node.
    pub leg: Leg,
    pub module: ModuleRef,
    /// Cached handle to the node's buffer-owning protocol stack.
    pub link_layer: Option<ModuleRef>,
    /// Terminal also holds a primary leg next to its native secondary one.
    pub dual_connectivity: bool,
}

impl NodeRecord {
    pub fn supports_leg(&self, leg: Leg) -> bool {
        match self.kind {
            NodeKind::BaseStation => self.leg == leg,
            NodeKind::Terminal => self.leg == leg || (self.dual_connectivity && leg == Leg::Primary),
        }
    }

    pub fn legs(&self) -> Vec<Leg> {
        Leg::ALL.into_iter().filter(|leg| self.supports_leg(*leg)).collect()
    }
}

/// Redirects downlink for a terminal from its losing station to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingEntry {
    pub source: NodeId,
    pub target: NodeId,
}

/// What an unregistration cascaded through.
#[derive(Debug)]
pub struct Unregistered {
    pub record: NodeRecord,
    pub addresses_removed: usize,
    pub serving_cleared: usize,
    pub forwarding_removed: usize,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    records: HashMap<NodeId, NodeRecord>,
    serving: PerLeg<HashMap<NodeId, NodeId>>,
    masters: HashMap<NodeId, NodeId>,
    secondaries: HashMap<NodeId, NodeId>,
    addresses: PerLeg<AddressTable>,
    forwarding: HashMap<NodeId, ForwardingEntry>,
    carriers: HashMap<NodeId, BTreeSet<CarrierId>>,
    multicast: MulticastGroups,
    usage: UsageSnapshot,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// The id's numeric range must match `kind`. For terminals the
    /// `is_secondary_technology` flag must match whether the id lies in the
    /// secondary sub-range; for base stations it selects the station's leg.
    pub fn register(&mut self, id: NodeId, kind: NodeKind, module: ModuleRef, is_secondary_technology: bool) -> Result<(), RegistryError> {
        if id.range_kind() != Some(kind) {
            return Err(RegistryError::RangeMismatch { id, kind });
        }
        if self.records.contains_key(&id) {
            return Err(RegistryError::AlreadyOccupied(id));
        }
        let leg = Leg::from_secondary_flag(is_secondary_technology);
        if kind == NodeKind::Terminal && id.in_secondary_range() != is_secondary_technology {
            return Err(RegistryError::TechnologyMismatch { id, leg });
        }

        log::debug!("Registered {} {} on the {} leg", kind, id, leg);
        self.records.insert(
            id,
            NodeRecord {
                id,
                kind,
                leg,
                module,
                link_layer: None,
                dual_connectivity: false,
            },
        );
        Ok(())
    }

    /// Remove a node and every cross-reference to it.
    ///
    /// Unregistering an unknown id is an invariant violation and is reported
    /// as [`RegistryError::NotRegistered`].
    pub fn unregister(&mut self, id: NodeId) -> Result<Unregistered, RegistryError> {
        let record = self.records.remove(&id).ok_or(RegistryError::NotRegistered(id))?;

        let mut addresses_removed = 0;
        for (_, table) in self.addresses.iter_mut() {
            addresses_removed += table.purge(id);
        }

        let mut serving_cleared = 0;
        for (_, table) in self.serving.iter_mut() {
            let before = table.len();
            table.retain(|terminal, station| *terminal != id && *station != id);
            serving_cleared += before - table.len();
        }

        let before = self.forwarding.len();
        self.forwarding
            .retain(|terminal, entry| *terminal != id && entry.source != id && entry.target != id);
        let forwarding_removed = before - self.forwarding.len();

        if let Some(master) = self.masters.remove(&id) {
            self.secondaries.remove(&master);
        }
        if let Some(secondary) = self.secondaries.remove(&id) {
            self.masters.remove(&secondary);
        }

        self.carriers.remove(&id);
        self.multicast.purge(id);
        self.usage.purge(id);

        log::debug!(
            "Unregistered {} {} (addresses: {}, serving: {}, forwarding: {})",
            record.kind,
            id,
            addresses_removed,
            serving_cleared,
            forwarding_removed
        );
        Ok(Unregistered {
            record,
            addresses_removed,
            serving_cleared,
            forwarding_removed,
        })
    }

    pub fn record(&self, id: NodeId) -> Option<&NodeRecord> {
        self.records.get(&id)
    }

    pub fn is_registered(&self, id: NodeId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.records.get(&id).map(|r| r.kind)
    }

    pub fn module(&self, id: NodeId) -> Option<ModuleRef> {
        self.records.get(&id).map(|r| r.module)
    }

    pub fn cache_link_layer(&mut self, id: NodeId, link_layer: ModuleRef) -> Result<(), RegistryError> {
        let record = self.records.get_mut(&id).ok_or(RegistryError::NotRegistered(id))?;
        record.link_layer = Some(link_layer);
        Ok(())
    }

    pub fn link_layer(&self, id: NodeId) -> Option<ModuleRef> {
        self.records.get(&id).and_then(|r| r.link_layer)
    }

    /// Give a secondary-technology terminal an additional primary leg.
    pub fn enable_dual_connectivity(&mut self, terminal: NodeId) -> Result<(), RegistryError> {
        let record = self.terminal_record(terminal)?;
        if record.leg != Leg::Secondary {
            return Err(RegistryError::TechnologyMismatch {
                id: terminal,
                leg: Leg::Secondary,
            });
        }
        if let Some(record) = self.records.get_mut(&terminal) {
            record.dual_connectivity = true;
        }
        Ok(())
    }

    pub fn base_stations(&self) -> Vec<NodeId> {
        self.ids_of(NodeKind::BaseStation)
    }

    pub fn terminals(&self) -> Vec<NodeId> {
        self.ids_of(NodeKind::Terminal)
    }

    fn ids_of(&self, kind: NodeKind) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.records.values().filter(|r| r.kind == kind).map(|r| r.id).collect();
        ids.sort();
        ids
    }

    fn terminal_record(&self, id: NodeId) -> Result<&NodeRecord, RegistryError> {
        let record = self.records.get(&id).ok_or(RegistryError::NotRegistered(id))?;
        if record.kind != NodeKind::Terminal {
            return Err(RegistryError::KindMismatch {
                id,
                expected: NodeKind::Terminal,
            });
        }
        Ok(record)
    }

    fn station_record(&self, id: NodeId) -> Result<&NodeRecord, RegistryError> {
        let record = self.records.get(&id).ok_or(RegistryError::NotRegistered(id))?;
        if record.kind != NodeKind::BaseStation {
            return Err(RegistryError::KindMismatch {
                id,
                expected: NodeKind::BaseStation,
            });
        }
        Ok(record)
    }

    // ---------- Serving assignments ----------

    /// Make `station` the serving node of `terminal` on the station's leg.
    ///
    /// Returns the previously serving station on that leg, if any.
    pub fn set_serving_node(&mut self, terminal: NodeId, station: NodeId) -> Result<Option<NodeId>, RegistryError> {
        let leg = self.station_record(station)?.leg;
        if !self.terminal_record(terminal)?.supports_leg(leg) {
            return Err(RegistryError::TechnologyMismatch { id: terminal, leg });
        }
        Ok(self.serving.get_mut(leg).insert(terminal, station))
    }

    /// Clear the serving assignment if it currently names `station`.
    ///
    /// Idempotent; the station may already be unregistered, so only the id
    /// ranges are checked. Clearing against `NodeId::NONE` is a no-op.
    pub fn clear_serving_node(&mut self, terminal: NodeId, station: NodeId) -> Result<bool, RegistryError> {
        if !terminal.is_terminal() {
            return Err(RegistryError::KindMismatch {
                id: terminal,
                expected: NodeKind::Terminal,
            });
        }
        if station.is_none() {
            return Ok(false);
        }
        if !station.is_base_station() {
            return Err(RegistryError::KindMismatch {
                id: station,
                expected: NodeKind::BaseStation,
            });
        }
        let mut cleared = false;
        for (_, table) in self.serving.iter_mut() {
            if table.get(&terminal) == Some(&station) {
                table.remove(&terminal);
                cleared = true;
            }
        }
        Ok(cleared)
    }

    /// Serving station on the terminal's native leg.
    pub fn serving_node(&self, terminal: NodeId) -> Option<NodeId> {
        let leg = self.records.get(&terminal).map(|r| r.leg).unwrap_or_else(|| terminal.native_leg());
        self.serving_node_on(terminal, leg)
    }

    pub fn serving_node_on(&self, terminal: NodeId, leg: Leg) -> Option<NodeId> {
        self.serving.get(leg).get(&terminal).copied()
    }

    /// Leg used for user data: secondary when attached there, else primary.
    pub fn selected_leg(&self, terminal: NodeId) -> Option<Leg> {
        [Leg::Secondary, Leg::Primary]
            .into_iter()
            .find(|leg| self.serving.get(*leg).contains_key(&terminal))
    }

    /// Where to deliver something addressed to `id`.
    ///
    /// A base station is its own next hop; a terminal's next hop is its
    /// serving station on the selected leg.
    pub fn next_hop(&self, id: NodeId) -> Option<NodeId> {
        match self.kind(id) {
            Some(NodeKind::BaseStation) => Some(id),
            Some(NodeKind::Terminal) => self.selected_leg(id).and_then(|leg| self.serving_node_on(id, leg)),
            None => None,
        }
    }

    /// Terminals currently served by `station` on any leg.
    pub fn served_by(&self, station: NodeId) -> Vec<NodeId> {
        let mut terminals: Vec<NodeId> = self
            .serving
            .iter()
            .flat_map(|(_, table)| table.iter().filter(|(_, s)| **s == station).map(|(t, _)| *t))
            .collect();
        terminals.sort();
        terminals.dedup();
        terminals
    }

    // ---------- Dual connectivity ----------

    /// Anchor a secondary-technology station to its master.
    pub fn set_master(&mut self, secondary: NodeId, master: NodeId) -> Result<(), RegistryError> {
        if self.station_record(secondary)?.leg != Leg::Secondary {
            return Err(RegistryError::TechnologyMismatch {
                id: secondary,
                leg: Leg::Secondary,
            });
        }
        if self.station_record(master)?.leg != Leg::Primary {
            return Err(RegistryError::TechnologyMismatch {
                id: master,
                leg: Leg::Primary,
            });
        }
        self.masters.insert(secondary, master);
        self.secondaries.insert(master, secondary);
        Ok(())
    }

    pub fn master_or_self(&self, station: NodeId) -> NodeId {
        self.masters.get(&station).copied().unwrap_or(station)
    }

    pub fn secondary_of(&self, station: NodeId) -> Option<NodeId> {
        self.secondaries.get(&station).copied()
    }

    // ---------- Address tables ----------

    pub fn bind(&mut self, leg: Leg, address: Ipv4Addr, id: NodeId) -> Result<(), RegistryError> {
        if !self.is_registered(id) {
            return Err(RegistryError::NotRegistered(id));
        }
        if let Some(previous) = self.addresses.get_mut(leg).bind(address, id) {
            if previous != id {
                log::warn!("Address {} rebound from {} to {}", address, previous, id);
            }
        }
        Ok(())
    }

    pub fn unbind(&mut self, leg: Leg, address: Ipv4Addr) -> Option<NodeId> {
        self.addresses.get_mut(leg).unbind(address)
    }

    pub fn resolve_on(&self, leg: Leg, address: Ipv4Addr) -> Option<NodeId> {
        self.addresses.get(leg).resolve(address)
    }

    /// Resolve on the primary table first, then the secondary one.
    pub fn resolve(&self, address: Ipv4Addr) -> Option<NodeId> {
        self.resolve_on(Leg::Primary, address).or_else(|| self.resolve_on(Leg::Secondary, address))
    }

    // ---------- Forwarding entries ----------

    pub fn install_forwarding(&mut self, source: NodeId, terminal: NodeId, target: NodeId) -> Result<(), RegistryError> {
        self.station_record(source)?;
        self.station_record(target)?;
        self.terminal_record(terminal)?;
        if let Some(existing) = self.forwarding.get(&terminal) {
            return Err(RegistryError::ForwardingExists {
                terminal,
                target: existing.target,
            });
        }
        self.forwarding.insert(terminal, ForwardingEntry { source, target });
        Ok(())
    }

    /// Target to relay to, when `station` is forwarding for `terminal`.
    pub fn forwarding_target(&self, station: NodeId, terminal: NodeId) -> Option<NodeId> {
        self.forwarding.get(&terminal).filter(|e| e.source == station).map(|e| e.target)
    }

    pub fn forwarding_entry(&self, terminal: NodeId) -> Option<ForwardingEntry> {
        self.forwarding.get(&terminal).copied()
    }

    pub fn remove_forwarding(&mut self, terminal: NodeId) -> Option<ForwardingEntry> {
        self.forwarding.remove(&terminal)
    }

    // ---------- Carriers ----------

    pub fn assign_carrier(&mut self, id: NodeId, carrier: CarrierId) -> Result<(), RegistryError> {
        if !self.is_registered(id) {
            return Err(RegistryError::NotRegistered(id));
        }
        self.carriers.entry(id).or_default().insert(carrier);
        Ok(())
    }

    pub fn carriers(&self, id: NodeId) -> Vec<CarrierId> {
        self.carriers.get(&id).map(|c| c.iter().copied().collect()).unwrap_or_default()
    }

    pub fn shares_carrier(&self, a: NodeId, b: NodeId) -> bool {
        match (self.carriers.get(&a), self.carriers.get(&b)) {
            (Some(left), Some(right)) => !left.is_disjoint(right),
            _ => false,
        }
    }

    // ---------- Multicast ----------

    pub fn join_multicast(&mut self, group: u32, id: NodeId) -> Result<bool, RegistryError> {
        if !self.is_registered(id) {
            return Err(RegistryError::NotRegistered(id));
        }
        Ok(self.multicast.join(group, id))
    }

    pub fn leave_multicast(&mut self, group: u32, id: NodeId) -> bool {
        self.multicast.leave(group, id)
    }

    pub fn multicast_members(&self, group: u32) -> Vec<NodeId> {
        self.multicast.members(group)
    }

    // ---------- Resource usage ----------

    pub fn record_usage(&mut self, id: NodeId, blocks: u32) {
        if self.is_registered(id) {
            self.usage.record(id, blocks);
        }
    }

    pub fn advance_slot(&mut self) {
        self.usage.advance();
    }

    pub fn usage(&self, id: NodeId) -> (u32, u32) {
        self.usage.usage(id)
    }

    /// Whether any table still mentions `id`.
    pub fn references(&self, id: NodeId) -> bool {
        self.records.contains_key(&id)
            || self.serving.iter().any(|(_, t)| t.contains_key(&id) || t.values().any(|s| *s == id))
            || self.masters.contains_key(&id)
            || self.secondaries.contains_key(&id)
            || self.addresses.iter().any(|(_, t)| t.references(id))
            || self.forwarding.iter().any(|(t, e)| *t == id || e.source == id || e.target == id)
            || self.carriers.contains_key(&id)
            || self.multicast.references(id)
            || self.usage.references(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Shutdown: report what is left and clear every table.
    pub fn teardown(&mut self) {
        let in_flight = self.forwarding.len();
        if in_flight > 0 {
            log::warn!("Registry teardown with {} forwarding entries still installed", in_flight);
        }
        log::info!(
            "Registry teardown: {} base stations, {} terminals",
            self.base_stations().len(),
            self.terminals().len()
        );
        self.records.clear();
        for (_, table) in self.serving.iter_mut() {
            table.clear();
        }
        self.masters.clear();
        self.secondaries.clear();
        for (_, table) in self.addresses.iter_mut() {
            table.clear();
        }
        self.forwarding.clear();
        self.carriers.clear();
        self.multicast.clear();
        self.usage.clear();
    }
}
