//! Side effects one node has on another.
//!
//! Gates and engines never reach into another node directly. Air deliveries,
//! tunnel relays and handover commands go through the [`RadioLink`] and
//! [`InterStationTunnel`] traits; the simulation implements both with an
//! ordered [`Outbox`] that it drains after every handler.

use std::collections::VecDeque;

use super::packet::Packet;
use crate::registry::NodeId;

/// Control messages exchanged between base stations over the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverCommand {
    /// Sent to the target at trigger: start holding downlink for `terminal`.
    Prepare { terminal: NodeId, source: NodeId },
    /// Sent to the source at completion: the handover of `terminal` is over.
    Complete { terminal: NodeId, target: Option<NodeId> },
}

pub trait RadioLink {
    fn deliver_over_air(&mut self, packet: Packet, from: NodeId, to: NodeId);
}

/// Reliable, ordered link between base stations.
pub trait InterStationTunnel {
    fn relay(&mut self, packet: Packet, from: NodeId, to: NodeId, terminal: NodeId);

    fn send_command(&mut self, from: NodeId, to: NodeId, command: HandoverCommand);
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboxItem {
    Air { packet: Packet, from: NodeId, to: NodeId },
    Relay { packet: Packet, from: NodeId, to: NodeId, terminal: NodeId },
    Command { from: NodeId, to: NodeId, command: HandoverCommand },
}

#[derive(Debug, Default)]
pub struct Outbox {
    items: VecDeque<OutboxItem>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&mut self) -> Option<OutboxItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl RadioLink for Outbox {
    fn deliver_over_air(&mut self, packet: Packet, from: NodeId, to: NodeId) {
        self.items.push_back(OutboxItem::Air { packet, from, to });
    }
}

impl InterStationTunnel for Outbox {
    fn relay(&mut self, packet: Packet, from: NodeId, to: NodeId, terminal: NodeId) {
        log::trace!("Tunnel {} -> {}: {}", from, to, packet);
        self.items.push_back(OutboxItem::Relay { packet, from, to, terminal });
    }

    fn send_command(&mut self, from: NodeId, to: NodeId, command: HandoverCommand) {
        log::debug!("Tunnel {} -> {}: {:?}", from, to, command);
        self.items.push_back(OutboxItem::Command { from, to, command });
    }
}
