//! Bounded FIFO packet queues used while an attachment is in flux.
//!
//! A handover that never completes would otherwise grow its queue forever, so
//! every queue has a capacity and an overflow policy. Drops are counted and a
//! warning is logged once occupancy crosses 80%.

use serde::Deserialize;
use std::collections::VecDeque;

use super::packet::{Origin, Packet};

/// Occupancy fraction above which a warning is logged.
const CAPACITY_WARNING_THRESHOLD: f32 = 0.8;

/// Default per-queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What to discard when a queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Pop the oldest queued packet to make room.
    #[default]
    DropOldest,
    /// Refuse the incoming packet.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug)]
pub struct PacketQueue {
    items: VecDeque<Packet>,
    config: QueueConfig,
    dropped: u64,
    warned: bool,
}

impl PacketQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: VecDeque::new(),
            config,
            dropped: 0,
            warned: false,
        }
    }

    /// Append at the tail. Returns the packet discarded by the overflow
    /// policy, if any.
    pub fn push(&mut self, packet: Packet) -> Option<Packet> {
        let capacity = self.config.capacity.max(1);
        let mut discarded = None;
        if self.items.len() >= capacity {
            self.dropped += 1;
            match self.config.overflow_policy {
                OverflowPolicy::DropOldest => {
                    discarded = self.items.pop_front();
                    self.items.push_back(packet);
                }
                OverflowPolicy::DropNewest => discarded = Some(packet),
            }
            log::error!("Queue for {} overflowed at {} packets, dropped {} so far", self.terminal_label(), capacity, self.dropped);
            return discarded;
        }

        self.items.push_back(packet);
        if !self.warned && self.items.len() as f32 >= capacity as f32 * CAPACITY_WARNING_THRESHOLD {
            self.warned = true;
            log::warn!("Queue for {} approaching capacity: {}/{}", self.terminal_label(), self.items.len(), capacity);
        }
        discarded
    }

    /// Remove every queued packet in arrival order.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.warned = false;
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn terminal_label(&self) -> String {
        self.items.front().map(|p| p.terminal.to_string()).unwrap_or_else(|| "-".to_string())
    }
}

/// Downlink queue at a target station, split by origin.
///
/// Tunneled packets were in flight before the handover committed, so they
/// drain ahead of anything the local IP layer queued afterwards.
#[derive(Debug)]
pub struct TunnelQueue {
    peer: PacketQueue,
    local: PacketQueue,
}

impl TunnelQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            peer: PacketQueue::new(config),
            local: PacketQueue::new(config),
        }
    }

    pub fn push(&mut self, origin: Origin, packet: Packet) -> Option<Packet> {
        match origin {
            Origin::PeerTunnel => self.peer.push(packet),
            Origin::LocalIp => self.local.push(packet),
        }
    }

    /// Peer-tunnel packets first, then local-IP packets, FIFO within each.
    pub fn drain_ordered(&mut self) -> Vec<(Origin, Packet)> {
        let mut drained: Vec<(Origin, Packet)> = self.peer.drain().into_iter().map(|p| (Origin::PeerTunnel, p)).collect();
        drained.extend(self.local.drain().into_iter().map(|p| (Origin::LocalIp, p)));
        drained
    }

    pub fn len(&self) -> usize {
        self.peer.len() + self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peer.is_empty() && self.local.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.peer.dropped() + self.local.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::packet::Direction;
    use crate::registry::NodeId;
    use embassy_time::Instant;

    fn packet(seq: u64) -> Packet {
        Packet::new(seq, NodeId::new(1025), Direction::Downlink, seq, 100, Instant::from_ticks(0))
    }

    fn config(capacity: usize, overflow_policy: OverflowPolicy) -> QueueConfig {
        QueueConfig { capacity, overflow_policy }
    }

    #[test]
    fn drop_oldest_keeps_the_newest_packets() {
        let mut queue = PacketQueue::new(config(2, OverflowPolicy::DropOldest));
        assert!(queue.push(packet(0)).is_none());
        assert!(queue.push(packet(1)).is_none());
        assert_eq!(queue.push(packet(2)).map(|p| p.flow_seq), Some(0));
        let kept: Vec<u64> = queue.drain().iter().map(|p| p.flow_seq).collect();
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn drop_newest_refuses_the_incoming_packet() {
        let mut queue = PacketQueue::new(config(1, OverflowPolicy::DropNewest));
        queue.push(packet(0));
        assert_eq!(queue.push(packet(1)).map(|p| p.flow_seq), Some(1));
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn tunnel_queue_drains_peer_before_local() {
        let mut queue = TunnelQueue::new(QueueConfig::default());
        queue.push(Origin::LocalIp, packet(10));
        queue.push(Origin::PeerTunnel, packet(1));
        queue.push(Origin::LocalIp, packet(11));
        queue.push(Origin::PeerTunnel, packet(2));
        assert_eq!(queue.len(), 4);

        let order: Vec<(Origin, u64)> = queue.drain_ordered().into_iter().map(|(o, p)| (o, p.flow_seq)).collect();
        assert_eq!(
            order,
            vec![
                (Origin::PeerTunnel, 1),
                (Origin::PeerTunnel, 2),
                (Origin::LocalIp, 10),
                (Origin::LocalIp, 11)
            ]
        );
        assert!(queue.is_empty());
    }
}
