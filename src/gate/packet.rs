//! IP-level packets as seen by the continuity gate.

use embassy_time::Instant;
use std::fmt;

use crate::registry::NodeId;

/// Direction of a flow relative to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => write!(f, "UL"),
            Direction::Downlink => write!(f, "DL"),
        }
    }
}

/// Where a packet queued at a target station came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Relayed by the losing station over the inter-station tunnel.
    PeerTunnel,
    /// Handed down by this station's own IP layer.
    LocalIp,
}

/// Why a packet did not make it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DropReason {
    /// Terminal has no serving station on any leg.
    Unattached,
    /// Hold or tunnel queue was full.
    Overflow,
    /// Station neither serves nor holds for the destination.
    StaleRoute,
    /// Destination address or node is not registered.
    Unresolved,
    /// No buffers exist for the peer at one end of the radio link.
    NoBuffers,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DropReason::Unattached => "unattached",
            DropReason::Overflow => "queue overflow",
            DropReason::StaleRoute => "stale route",
            DropReason::Unresolved => "unresolved destination",
            DropReason::NoBuffers => "no buffers",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Globally unique packet id.
    pub id: u64,
    /// Terminal whose connection the packet belongs to.
    pub terminal: NodeId,
    pub direction: Direction,
    /// Position within the terminal's flow in this direction, starting at 0.
    pub flow_seq: u64,
    pub size: usize,
    pub created: Instant,
}

impl Packet {
    pub fn new(id: u64, terminal: NodeId, direction: Direction, flow_seq: u64, size: usize, created: Instant) -> Self {
        Self {
            id,
            terminal,
            direction,
            flow_seq,
            size,
            created,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}#{} ({} B)", self.terminal, self.direction, self.flow_seq, self.size)
    }
}
