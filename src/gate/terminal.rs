use crate::registry::{Leg, NodeId, NodeRegistry, PerLeg};

use super::outbox::RadioLink;
use super::packet::{DropReason, Packet};
use super::queue::{PacketQueue, QueueConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkOutcome {
    Delivered { leg: Leg, station: NodeId },
    Held,
    Dropped(DropReason),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TerminalGateStats {
    pub delivered: u64,
    pub held: u64,
    pub drained: u64,
    pub dropped_unattached: u64,
    pub dropped_overflow: u64,
}

/// Uplink gate on the terminal side.
///
/// While any leg is in flux every uplink packet goes to the hold queue. The
/// queue drains in arrival order once the last leg stops holding.
#[derive(Debug)]
pub struct TerminalGate {
    terminal: NodeId,
    /// Target each holding leg is moving to. `Some(None)` is a detach.
    holding: PerLeg<Option<Option<NodeId>>>,
    hold_queue: PacketQueue,
    stats: TerminalGateStats,
}

impl TerminalGate {
    pub fn new(terminal: NodeId, queue_config: QueueConfig) -> Self {
        Self {
            terminal,
            holding: PerLeg::default(),
            hold_queue: PacketQueue::new(queue_config),
            stats: TerminalGateStats::default(),
        }
    }

    pub fn terminal(&self) -> NodeId {
        self.terminal
    }

    pub fn send(&mut self, registry: &NodeRegistry, packet: Packet, radio: &mut dyn RadioLink) -> UplinkOutcome {
        if self.is_holding() {
            if self.hold_queue.push(packet).is_some() {
                self.stats.dropped_overflow += 1;
            }
            self.stats.held += 1;
            return UplinkOutcome::Held;
        }
        self.deliver(registry, packet, radio)
    }

    pub fn start_holding(&mut self, leg: Leg, new_target: Option<NodeId>) {
        log::debug!("{}: holding uplink on the {} leg (target {:?})", self.terminal, leg, new_target);
        *self.holding.get_mut(leg) = Some(new_target);
    }

    /// Stop holding on `leg`. When no leg is holding any more, the hold queue
    /// is drained to the serving station of the selected leg.
    ///
    /// Returns the number of packets handed to the radio.
    pub fn stop_holding(&mut self, leg: Leg, registry: &NodeRegistry, radio: &mut dyn RadioLink) -> usize {
        *self.holding.get_mut(leg) = None;
        if self.is_holding() {
            return 0;
        }

        let mut delivered = 0;
        for packet in self.hold_queue.drain() {
            self.stats.drained += 1;
            if let UplinkOutcome::Delivered { .. } = self.deliver(registry, packet, radio) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn is_holding(&self) -> bool {
        self.holding.iter().any(|(_, h)| h.is_some())
    }

    pub fn is_holding_on(&self, leg: Leg) -> bool {
        self.holding.get(leg).is_some()
    }

    pub fn held(&self) -> usize {
        self.hold_queue.len()
    }

    /// Drop every held packet and all hold state.
    pub fn discard(&mut self) -> usize {
        self.holding = PerLeg::default();
        self.hold_queue.drain().len()
    }

    pub fn stats(&self) -> TerminalGateStats {
        TerminalGateStats {
            dropped_overflow: self.hold_queue.dropped(),
            ..self.stats
        }
    }

    fn deliver(&mut self, registry: &NodeRegistry, packet: Packet, radio: &mut dyn RadioLink) -> UplinkOutcome {
        let Some(leg) = registry.selected_leg(self.terminal) else {
            log::debug!("{}: unattached, dropping {}", self.terminal, packet);
            self.stats.dropped_unattached += 1;
            return UplinkOutcome::Dropped(DropReason::Unattached);
        };
        let Some(station) = registry.serving_node_on(self.terminal, leg) else {
            self.stats.dropped_unattached += 1;
            return UplinkOutcome::Dropped(DropReason::Unattached);
        };
        radio.deliver_over_air(packet, self.terminal, station);
        self.stats.delivered += 1;
        UplinkOutcome::Delivered { leg, station }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::outbox::{Outbox, OutboxItem};
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

    fn uplink(seq: u64) -> Packet {
        Packet::new(seq, UE, Direction::Uplink, seq, 200, Instant::from_ticks(0))
    }

    fn air_targets(outbox: &mut Outbox) -> Vec<(u64, NodeId)> {
        let mut out = Vec::new();
        while let Some(item) = outbox.pop() {
            if let OutboxItem::Air { packet, to, .. } = item {
                out.push((packet.flow_seq, to));
            }
        }
        out
    }

    #[test]
    fn unattached_terminal_drops_uplink() {
        let registry = registry();
        let mut gate = TerminalGate::new(UE, QueueConfig::default());
        let mut outbox = Outbox::new();

        let outcome = gate.send(&registry, uplink(0), &mut outbox);
        assert_eq!(outcome, UplinkOutcome::Dropped(DropReason::Unattached));
        assert!(outbox.is_empty());
        assert_eq!(gate.stats().dropped_unattached, 1);
    }

    #[test]
    fn attached_terminal_delivers_to_serving_station() {
        let mut registry = registry();
        registry.set_serving_node(UE, BS1).unwrap();
        let mut gate = TerminalGate::new(UE, QueueConfig::default());
        let mut outbox = Outbox::new();

        let outcome = gate.send(&registry, uplink(0), &mut outbox);
        assert_eq!(
            outcome,
            UplinkOutcome::Delivered {
                leg: Leg::Primary,
                station: BS1
            }
        );
        assert_eq!(air_targets(&mut outbox), vec![(0, BS1)]);
    }

    #[test]
    fn held_packets_drain_in_order_to_the_new_station() {
        let mut registry = registry();
        registry.set_serving_node(UE, BS1).unwrap();
        let mut gate = TerminalGate::new(UE, QueueConfig::default());
        let mut outbox = Outbox::new();

        gate.start_holding(Leg::Primary, Some(BS2));
        for seq in 0..3 {
            assert_eq!(gate.send(&registry, uplink(seq), &mut outbox), UplinkOutcome::Held);
        }
        assert!(outbox.is_empty());
        assert_eq!(gate.held(), 3);

        registry.clear_serving_node(UE, BS1).unwrap();
        registry.set_serving_node(UE, BS2).unwrap();
        assert_eq!(gate.stop_holding(Leg::Primary, &registry, &mut outbox), 3);
        assert_eq!(air_targets(&mut outbox), vec![(0, BS2), (1, BS2), (2, BS2)]);
        assert!(!gate.is_holding());
    }

    #[test]
    fn queue_drains_only_after_the_last_leg_stops_holding() {
        let mut registry = registry();
        registry.set_serving_node(UE, BS1).unwrap();
        let mut gate = TerminalGate::new(UE, QueueConfig::default());
        let mut outbox = Outbox::new();

        gate.start_holding(Leg::Primary, Some(BS2));
        gate.start_holding(Leg::Secondary, None);
        gate.send(&registry, uplink(0), &mut outbox);

        assert_eq!(gate.stop_holding(Leg::Primary, &registry, &mut outbox), 0);
        assert_eq!(gate.held(), 1);
        assert!(gate.is_holding_on(Leg::Secondary));
        assert_eq!(gate.stop_holding(Leg::Secondary, &registry, &mut outbox), 1);
        assert_eq!(gate.held(), 0);
    }

    #[test]
    fn drain_after_detach_drops_held_packets() {
        let mut registry = registry();
        registry.set_serving_node(UE, BS1).unwrap();
        let mut gate = TerminalGate::new(UE, QueueConfig::default());
        let mut outbox = Outbox::new();

        gate.start_holding(Leg::Primary, None);
        gate.send(&registry, uplink(0), &mut outbox);
        registry.clear_serving_node(UE, BS1).unwrap();

        assert_eq!(gate.stop_holding(Leg::Primary, &registry, &mut outbox), 0);
        assert!(outbox.is_empty());
        assert_eq!(gate.stats().dropped_unattached, 1);
    }
}
