use crate::gate::Packet;
use crate::registry::NodeId;

use super::layers::{BufferLayer, Reordered, ReorderingLayer, RetransmissionLayer, SequencingLayer};

/// The buffer-owning protocol stack of one node.
#[derive(Debug)]
pub struct ProtocolStack {
    owner: NodeId,
    pub sequencing: SequencingLayer,
    pub reordering: ReorderingLayer,
    pub retransmission: RetransmissionLayer,
}

impl ProtocolStack {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            sequencing: SequencingLayer::default(),
            reordering: ReorderingLayer::default(),
            retransmission: RetransmissionLayer::default(),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    fn layers_mut(&mut self) -> [&mut dyn BufferLayer; 3] {
        [&mut self.retransmission, &mut self.reordering, &mut self.sequencing]
    }

    fn layers(&self) -> [&dyn BufferLayer; 3] {
        [&self.retransmission, &self.reordering, &self.sequencing]
    }

    /// Create a fresh buffer set for `peer` in every layer.
    pub fn create_buffers(&mut self, peer: NodeId) {
        for layer in self.layers_mut() {
            layer.create_buffers(peer);
        }
    }

    /// Destroy the buffer set for `peer` in every layer. Returns how many
    /// layers actually held buffers.
    pub fn destroy_buffers(&mut self, peer: NodeId) -> usize {
        let owner = self.owner;
        let mut destroyed = 0;
        for layer in self.layers_mut() {
            if layer.destroy_buffers(peer) {
                destroyed += 1;
            } else {
                log::trace!("{}: no {} buffers for {}", owner, layer.name(), peer);
            }
        }
        destroyed
    }

    /// True only when every layer has buffers for `peer`.
    pub fn has_buffers(&self, peer: NodeId) -> bool {
        self.layers().iter().all(|layer| layer.has_buffers(peer))
    }

    /// True when any layer still holds something for `peer`.
    pub fn has_any_buffers(&self, peer: NodeId) -> bool {
        self.layers().iter().any(|layer| layer.has_buffers(peer))
    }

    /// Peers with at least one buffer, sorted.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.layers().iter().flat_map(|layer| layer.peers()).collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Push `packet` through the transmit side towards `peer`. Returns the
    /// sequence number it was sent under, or `None` without buffers.
    pub fn transmit(&mut self, peer: NodeId, packet: Packet) -> Option<(u32, Packet)> {
        if !self.has_buffers(peer) {
            return None;
        }
        let sn = self.sequencing.assign(peer)?;
        self.retransmission.enqueue(peer, packet);
        let sent = self.retransmission.transmit_next(peer, sn)?;
        Some((sn, sent))
    }

    /// Receive side for a PDU from `peer`.
    pub fn receive(&mut self, peer: NodeId, sn: u32, packet: Packet) -> Option<Reordered> {
        if !self.has_buffers(peer) {
            return None;
        }
        self.sequencing.note_received(peer, sn);
        self.reordering.accept(peer, sn, packet)
    }

    pub fn acknowledge(&mut self, peer: NodeId, sn: u32) -> bool {
        self.retransmission.acknowledge(peer, sn)
    }

    /// Drop everything held for every peer.
    pub fn clear(&mut self) -> usize {
        let peers = self.peers();
        for peer in &peers {
            self.destroy_buffers(*peer);
        }
        peers.len()
    }
}
