//! Per-peer link-layer state owned by a node's protocol stack.
//!
//! Each layer keeps one buffer set per peer node. A base station's stack holds
//! one set per attached terminal; a terminal's stack holds the mirror set keyed
//! by its serving station.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::gate::Packet;
use crate::registry::NodeId;

/// Sequence numbers wrap at 2^12, like a 12-bit PDCP SN.
pub const SEQUENCE_MODULUS: u32 = 4096;

/// Layer owning per-peer buffers that are torn down and rebuilt on handover.
pub trait BufferLayer {
    fn name(&self) -> &'static str;

    /// Create fresh buffers for `peer`, counters at their initial value.
    /// Replaces any existing set.
    fn create_buffers(&mut self, peer: NodeId);

    /// Destroy every buffer for `peer`. Returns false if there were none.
    fn destroy_buffers(&mut self, peer: NodeId) -> bool;

    fn has_buffers(&self, peer: NodeId) -> bool;

    fn peers(&self) -> Vec<NodeId>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequencingState {
    pub next_tx: u32,
    pub last_rx: Option<u32>,
}

#[derive(Debug, Default)]
pub struct SequencingLayer {
    states: HashMap<NodeId, SequencingState>,
}

impl SequencingLayer {
    pub fn state(&self, peer: NodeId) -> Option<SequencingState> {
        self.states.get(&peer).copied()
    }

    /// Stamp the next transmit sequence number for `peer`.
    pub fn assign(&mut self, peer: NodeId) -> Option<u32> {
        let state = self.states.get_mut(&peer)?;
        let sn = state.next_tx;
        state.next_tx = (state.next_tx + 1) % SEQUENCE_MODULUS;
        Some(sn)
    }

    pub fn note_received(&mut self, peer: NodeId, sn: u32) {
        if let Some(state) = self.states.get_mut(&peer) {
            state.last_rx = Some(sn);
        }
    }
}

impl BufferLayer for SequencingLayer {
    fn name(&self) -> &'static str {
        "sequencing"
    }

    fn create_buffers(&mut self, peer: NodeId) {
        self.states.insert(peer, SequencingState::default());
    }

    fn destroy_buffers(&mut self, peer: NodeId) -> bool {
        self.states.remove(&peer).is_some()
    }

    fn has_buffers(&self, peer: NodeId) -> bool {
        self.states.contains_key(&peer)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.states.keys().copied().collect()
    }
}

#[derive(Debug, Default)]
struct ReorderingState {
    expected: u32,
    held: BTreeMap<u32, Packet>,
    duplicates: u64,
}

/// Result of feeding one PDU into the reordering buffer.
#[derive(Debug, Default, PartialEq)]
pub struct Reordered {
    /// Packets released in sequence order.
    pub released: Vec<Packet>,
    pub duplicate: bool,
}

/// In-order delivery with duplicate detection.
///
/// A PDU ahead of the expected number waits in the hold area. One behind the
/// expected window, or already held, counts as a duplicate and is discarded.
#[derive(Debug, Default)]
pub struct ReorderingLayer {
    states: HashMap<NodeId, ReorderingState>,
}

impl ReorderingLayer {
    pub fn accept(&mut self, peer: NodeId, sn: u32, packet: Packet) -> Option<Reordered> {
        let state = self.states.get_mut(&peer)?;
        let mut result = Reordered::default();

        let ahead = (sn + SEQUENCE_MODULUS - state.expected) % SEQUENCE_MODULUS;
        if ahead >= SEQUENCE_MODULUS / 2 || state.held.contains_key(&sn) {
            state.duplicates += 1;
            result.duplicate = true;
            return Some(result);
        }

        state.held.insert(sn, packet);
        while let Some(next) = state.held.remove(&state.expected) {
            result.released.push(next);
            state.expected = (state.expected + 1) % SEQUENCE_MODULUS;
        }
        Some(result)
    }

    pub fn expected(&self, peer: NodeId) -> Option<u32> {
        self.states.get(&peer).map(|s| s.expected)
    }

    pub fn held(&self, peer: NodeId) -> usize {
        self.states.get(&peer).map(|s| s.held.len()).unwrap_or(0)
    }

    pub fn duplicates(&self, peer: NodeId) -> u64 {
        self.states.get(&peer).map(|s| s.duplicates).unwrap_or(0)
    }
}

impl BufferLayer for ReorderingLayer {
    fn name(&self) -> &'static str {
        "reordering"
    }

    fn create_buffers(&mut self, peer: NodeId) {
        self.states.insert(peer, ReorderingState::default());
    }

    fn destroy_buffers(&mut self, peer: NodeId) -> bool {
        self.states.remove(&peer).is_some()
    }

    fn has_buffers(&self, peer: NodeId) -> bool {
        self.states.contains_key(&peer)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.states.keys().copied().collect()
    }
}

#[derive(Debug, Default)]
struct RetransmissionState {
    in_flight: BTreeMap<u32, Packet>,
    unsent: VecDeque<Packet>,
}

/// Acknowledged-mode transmit buffers: SDUs queued for sending and SDUs sent
/// but not yet acknowledged.
#[derive(Debug, Default)]
pub struct RetransmissionLayer {
    states: HashMap<NodeId, RetransmissionState>,
}

impl RetransmissionLayer {
    pub fn enqueue(&mut self, peer: NodeId, packet: Packet) -> bool {
        match self.states.get_mut(&peer) {
            Some(state) => {
                state.unsent.push_back(packet);
                true
            }
            None => false,
        }
    }

    /// Move the oldest unsent SDU to the in-flight set under `sn`.
    pub fn transmit_next(&mut self, peer: NodeId, sn: u32) -> Option<Packet> {
        let state = self.states.get_mut(&peer)?;
        let packet = state.unsent.pop_front()?;
        state.in_flight.insert(sn, packet.clone());
        Some(packet)
    }

    pub fn acknowledge(&mut self, peer: NodeId, sn: u32) -> bool {
        self.states.get_mut(&peer).and_then(|s| s.in_flight.remove(&sn)).is_some()
    }

    pub fn in_flight(&self, peer: NodeId) -> usize {
        self.states.get(&peer).map(|s| s.in_flight.len()).unwrap_or(0)
    }

    pub fn unsent(&self, peer: NodeId) -> usize {
        self.states.get(&peer).map(|s| s.unsent.len()).unwrap_or(0)
    }
}

impl BufferLayer for RetransmissionLayer {
    fn name(&self) -> &'static str {
        "retransmission"
    }

    fn create_buffers(&mut self, peer: NodeId) {
        self.states.insert(peer, RetransmissionState::default());
    }

    fn destroy_buffers(&mut self, peer: NodeId) -> bool {
        match self.states.remove(&peer) {
            Some(state) => {
                let lost = state.in_flight.len() + state.unsent.len();
                if lost > 0 {
                    log::debug!("Discarding {} buffered SDUs for {}", lost, peer);
                }
                true
            }
            None => false,
        }
    }

    fn has_buffers(&self, peer: NodeId) -> bool {
        self.states.contains_key(&peer)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.states.keys().copied().collect()
    }
}
