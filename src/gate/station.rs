use std::collections::HashMap;

use crate::registry::{NodeId, NodeRegistry};

use super::outbox::{InterStationTunnel, RadioLink};
use super::packet::{DropReason, Origin, Packet};
use super::queue::{QueueConfig, TunnelQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkOutcome {
    Delivered,
    Relayed { target: NodeId },
    Queued,
    Dropped(DropReason),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StationGateStats {
    pub delivered: u64,
    pub relayed: u64,
    pub queued_local: u64,
    pub queued_tunneled: u64,
    pub flushed: u64,
    pub dropped_stale: u64,
    pub dropped_overflow: u64,
    pub discarded: u64,
}

#[derive(Debug)]
struct HoldState {
    source: Option<NodeId>,
    queue: TunnelQueue,
}

/// Downlink gate at a base station.
///
/// A losing station relays to the target while a forwarding entry exists. A
/// gaining station queues everything for the terminal until the attach
/// completes, then flushes tunneled packets ahead of locally received ones.
#[derive(Debug)]
pub struct StationGate {
    station: NodeId,
    queue_config: QueueConfig,
    holding: HashMap<NodeId, HoldState>,
    stats: StationGateStats,
}

impl StationGate {
    pub fn new(station: NodeId, queue_config: QueueConfig) -> Self {
        Self {
            station,
            queue_config,
            holding: HashMap::new(),
            stats: StationGateStats::default(),
        }
    }

    pub fn station(&self) -> NodeId {
        self.station
    }

    /// Downlink packet for `terminal` arriving from the core network.
    pub fn receive<L>(&mut self, registry: &NodeRegistry, packet: Packet, terminal: NodeId, link: &mut L) -> DownlinkOutcome
    where
        L: RadioLink + InterStationTunnel,
    {
        if let Some(target) = registry.forwarding_target(self.station, terminal) {
            link.relay(packet, self.station, target, terminal);
            self.stats.relayed += 1;
            return DownlinkOutcome::Relayed { target };
        }

        if let Some(hold) = self.holding.get_mut(&terminal) {
            if hold.queue.push(Origin::LocalIp, packet).is_some() {
                self.stats.dropped_overflow += 1;
            }
            self.stats.queued_local += 1;
            return DownlinkOutcome::Queued;
        }

        if self.serves(registry, terminal) {
            link.deliver_over_air(packet, self.station, terminal);
            self.stats.delivered += 1;
            return DownlinkOutcome::Delivered;
        }

        log::debug!("{}: no route to {}, dropping {}", self.station, terminal, packet);
        self.stats.dropped_stale += 1;
        DownlinkOutcome::Dropped(DropReason::StaleRoute)
    }

    /// Packet relayed by the losing station. Always queued.
    pub fn receive_tunneled(&mut self, packet: Packet, terminal: NodeId) {
        let station = self.station;
        let config = self.queue_config;
        let hold = self.holding.entry(terminal).or_insert_with(|| {
            log::warn!("{}: tunneled packet for {} before Prepare, holding anyway", station, terminal);
            HoldState {
                source: None,
                queue: TunnelQueue::new(config),
            }
        });
        if hold.queue.push(Origin::PeerTunnel, packet).is_some() {
            self.stats.dropped_overflow += 1;
        }
        self.stats.queued_tunneled += 1;
    }

    /// Start holding downlink for `terminal`; triggered by `Prepare`.
    pub fn start_holding(&mut self, terminal: NodeId, source: Option<NodeId>) {
        log::debug!("{}: holding downlink for {} (source {:?})", self.station, terminal, source);
        let config = self.queue_config;
        let hold = self.holding.entry(terminal).or_insert_with(|| HoldState {
            source: None,
            queue: TunnelQueue::new(config),
        });
        hold.source = source;
    }

    pub fn is_holding(&self, terminal: NodeId) -> bool {
        self.holding.contains_key(&terminal)
    }

    pub fn holding_source(&self, terminal: NodeId) -> Option<NodeId> {
        self.holding.get(&terminal).and_then(|h| h.source)
    }

    pub fn queued(&self, terminal: NodeId) -> usize {
        self.holding.get(&terminal).map(|h| h.queue.len()).unwrap_or(0)
    }

    /// Flush the terminal's queue over the air, peer-tunnel packets first, and
    /// clear the hold state. Returns the number of packets flushed.
    pub fn complete_attach(&mut self, terminal: NodeId, radio: &mut dyn RadioLink) -> usize {
        let Some(mut hold) = self.holding.remove(&terminal) else {
            return 0;
        };
        let drained = hold.queue.drain_ordered();
        let flushed = drained.len();
        for (_, packet) in drained {
            radio.deliver_over_air(packet, self.station, terminal);
        }
        self.stats.flushed += flushed as u64;
        if flushed > 0 {
            log::debug!("{}: flushed {} packets to {}", self.station, flushed, terminal);
        }
        flushed
    }

    /// Drop the queue and hold state for `terminal`.
    pub fn discard(&mut self, terminal: NodeId) -> usize {
        let discarded = self.holding.remove(&terminal).map(|mut h| h.queue.drain_ordered().len()).unwrap_or(0);
        self.stats.discarded += discarded as u64;
        discarded
    }

    /// Terminals currently held at this station.
    pub fn held_terminals(&self) -> Vec<NodeId> {
        let mut terminals: Vec<NodeId> = self.holding.keys().copied().collect();
        terminals.sort();
        terminals
    }

    pub fn stats(&self) -> StationGateStats {
        self.stats
    }

    fn serves(&self, registry: &NodeRegistry, terminal: NodeId) -> bool {
        registry
            .record(self.station)
            .map(|r| registry.serving_node_on(terminal, r.leg) == Some(self.station))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::outbox::{HandoverCommand, Outbox, OutboxItem};
    use crate::gate::packet::Direction;
    use crate::registry::{ModuleRef, NodeKind};
    use embassy_time::Instant;

    const BS1: NodeId = NodeId::new(1);
    const BS2: NodeId = NodeId::new(2);
    const UE: NodeId = NodeId::new(1025);

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(BS1, NodeKind::BaseStation, ModuleRef(0), false).unwrap();
        registry.register(BS2, NodeKind::BaseStation, ModuleRef(1), false).unwrap();
        registry.register(UE, NodeKind::Terminal, ModuleRef(2), false).unwrap();
        registry
    }

    fn downlink(seq: u64) -> Packet {
        Packet::new(100 + seq, UE, Direction::Downlink, seq, 500, Instant::from_ticks(0))
    }

    #[test]
    fn serving_station_delivers_locally() {
        let mut registry = registry();
        registry.set_serving_node(UE, BS1).unwrap();
        let mut gate = StationGate::new(BS1, QueueConfig::default());
        let mut outbox = Outbox::new();

        assert_eq!(gate.receive(&registry, downlink(0), UE, &mut outbox), DownlinkOutcome::Delivered);
        assert!(matches!(outbox.pop(), Some(OutboxItem::Air { from: BS1, to: UE, .. })));
        assert!(outbox.is_empty());
    }

    #[test]
    fn forwarding_entry_relays_over_the_tunnel() {
        let mut registry = registry();
        registry.set_serving_node(UE, BS1).unwrap();
        registry.install_forwarding(BS1, UE, BS2).unwrap();
        let mut gate = StationGate::new(BS1, QueueConfig::default());
        let mut outbox = Outbox::new();

        assert_eq!(gate.receive(&registry, downlink(0), UE, &mut outbox), DownlinkOutcome::Relayed { target: BS2 });
        match outbox.pop() {
            Some(OutboxItem::Relay { from, to, terminal, packet }) => {
                assert_eq!((from, to, terminal), (BS1, BS2, UE));
                assert_eq!(packet, downlink(0));
            }
            other => panic!("expected a relay, got {:?}", other),
        }
        assert!(outbox.is_empty());
    }

    #[test]
    fn stale_route_is_dropped() {
        let registry = registry();
        let mut gate = StationGate::new(BS2, QueueConfig::default());
        let mut outbox = Outbox::new();

        assert_eq!(
            gate.receive(&registry, downlink(0), UE, &mut outbox),
            DownlinkOutcome::Dropped(DropReason::StaleRoute)
        );
        assert_eq!(gate.stats().dropped_stale, 1);
        assert!(outbox.is_empty());
    }

    #[test]
    fn tunneled_packets_flush_before_local_ones() {
        let registry = registry();
        let mut gate = StationGate::new(BS2, QueueConfig::default());
        let mut outbox = Outbox::new();

        gate.start_holding(UE, Some(BS1));
        assert_eq!(gate.receive(&registry, downlink(2), UE, &mut outbox), DownlinkOutcome::Queued);
        gate.receive_tunneled(downlink(1), UE);
        assert_eq!(gate.queued(UE), 2);
        assert_eq!(gate.holding_source(UE), Some(BS1));
        assert!(outbox.is_empty());

        assert_eq!(gate.complete_attach(UE, &mut outbox), 2);
        let mut order = Vec::new();
        while let Some(OutboxItem::Air { packet, from, to }) = outbox.pop() {
            assert_eq!((from, to), (BS2, UE));
            order.push(packet.flow_seq);
        }
        assert_eq!(order, vec![1, 2]);
        assert!(!gate.is_holding(UE));
    }

    #[test]
    fn tunneled_packet_without_prepare_still_queues() {
        let mut gate = StationGate::new(BS2, QueueConfig::default());
        gate.receive_tunneled(downlink(0), UE);
        assert!(gate.is_holding(UE));
        assert_eq!(gate.holding_source(UE), None);
    }

    #[test]
    fn discard_drops_queue_and_hold_state() {
        let registry = registry();
        let mut gate = StationGate::new(BS2, QueueConfig::default());
        let mut outbox = Outbox::new();
        gate.start_holding(UE, Some(BS1));
        gate.receive(&registry, downlink(0), UE, &mut outbox);
        gate.receive_tunneled(downlink(1), UE);

        assert_eq!(gate.discard(UE), 2);
        assert!(!gate.is_holding(UE));
        assert_eq!(gate.complete_attach(UE, &mut outbox), 0);
        assert!(outbox.is_empty());
        assert_eq!(gate.stats().discarded, 2);
    }

    #[test]
    fn commands_are_ordered_with_relays() {
        let mut tunnel = Outbox::new();
        tunnel.send_command(BS1, BS2, HandoverCommand::Prepare { terminal: UE, source: BS1 });
        tunnel.relay(downlink(0), BS1, BS2, UE);
        assert!(matches!(tunnel.pop(), Some(OutboxItem::Command { .. })));
        assert!(matches!(tunnel.pop(), Some(OutboxItem::Relay { .. })));
    }
}
