//! Type definitions for the simulation.
//!
//! Contains the event type driven by the scheduler, the per-node runtime
//! state kept by the network, and the delivery accounting behind the report.

use embassy_time::Duration;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use crate::common::scene::{Point, TrafficProfile, Velocity};
use crate::gate::{Direction, DropReason, Packet, TerminalGate};
use crate::handover::{Completion, HandoverTimer};
use crate::registry::{Leg, NodeId};

/// Bytes carried by one resource block in the usage snapshot.
pub const RESOURCE_BLOCK_BYTES: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Move terminals, advance the usage slot and deliver every beacon.
    BeaconRound,
    Handover(HandoverTimer),
    /// Constant-bit-rate source tick for one terminal and direction.
    Traffic { terminal: NodeId, direction: Direction },
    /// Downlink packet reaching a base station over the backhaul.
    BackhaulArrival { station: NodeId, packet: Packet },
    /// Node leaves the network.
    Departure { node: NodeId },
}

impl From<HandoverTimer> for Event {
    fn from(timer: HandoverTimer) -> Self {
        Event::Handover(timer)
    }
}

#[derive(Debug)]
pub struct StationState {
    pub id: NodeId,
    pub leg: Leg,
    pub position: Point,
    pub tx_power: f64,
}

#[derive(Debug)]
pub struct TerminalState {
    pub id: NodeId,
    pub address: Ipv4Addr,
    pub position: Point,
    pub velocity: Velocity,
    pub traffic: TrafficProfile,
    pub gate: TerminalGate,
    next_seq: BTreeMap<Direction, u64>,
}

impl TerminalState {
    pub fn new(id: NodeId, address: Ipv4Addr, position: Point, velocity: Velocity, traffic: TrafficProfile, gate: TerminalGate) -> Self {
        Self {
            id,
            address,
            position,
            velocity,
            traffic,
            gate,
            next_seq: BTreeMap::new(),
        }
    }

    /// Next sequence number of this terminal's flow in `direction`.
    pub fn next_flow_seq(&mut self, direction: Direction) -> u64 {
        let seq = self.next_seq.entry(direction).or_insert(0);
        let current = *seq;
        *seq += 1;
        current
    }

    pub fn interval(&self, direction: Direction) -> Option<Duration> {
        let ms = match direction {
            Direction::Uplink => self.traffic.uplink_interval_ms,
            Direction::Downlink => self.traffic.downlink_interval_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

/// Delivery record of one flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub sent: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    highest: Option<u64>,
}

impl FlowStats {
    fn record(&mut self, flow_seq: u64) {
        match self.highest {
            Some(highest) if flow_seq == highest => self.duplicates += 1,
            Some(highest) if flow_seq < highest => self.out_of_order += 1,
            _ => {
                self.highest = Some(flow_seq);
                self.delivered += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Accounting {
    flows: BTreeMap<(NodeId, Direction), FlowStats>,
    drops: BTreeMap<DropReason, u64>,
    completions: Vec<Completion>,
    pub link_duplicates: u64,
    pub handover_acks: u64,
}

impl Accounting {
    pub fn sent(&mut self, packet: &Packet) {
        self.flows.entry((packet.terminal, packet.direction)).or_default().sent += 1;
    }

    /// Record a packet handed to the IP layer at its destination.
    pub fn delivered(&mut self, packet: &Packet) {
        let flow = self.flows.entry((packet.terminal, packet.direction)).or_default();
        let before = *flow;
        flow.record(packet.flow_seq);
        if flow.duplicates > before.duplicates || flow.out_of_order > before.out_of_order {
            log::warn!("Misordered delivery of {} (highest so far {:?})", packet, before.highest);
        }
    }

    pub fn dropped(&mut self, reason: DropReason) {
        *self.drops.entry(reason).or_insert(0) += 1;
    }

    pub fn completed(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    pub fn flow(&self, terminal: NodeId, direction: Direction) -> FlowStats {
        self.flows.get(&(terminal, direction)).copied().unwrap_or_default()
    }

    pub fn flows(&self) -> impl Iterator<Item = (&(NodeId, Direction), &FlowStats)> {
        self.flows.iter()
    }

    pub fn drops(&self) -> &BTreeMap<DropReason, u64> {
        &self.drops
    }

    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }
}

/// Summary of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub simulated: Duration,
    pub events: u64,
    /// Station-to-station handovers.
    pub handovers: u64,
    pub attaches: u64,
    pub detaches: u64,
    pub refused: u64,
    pub reverted: u64,
    pub aborted: u64,
    pub mean_handover_latency_us: u64,
    pub uplink: FlowStats,
    pub downlink: FlowStats,
    pub link_duplicates: u64,
    pub drops: BTreeMap<DropReason, u64>,
    pub relayed: u64,
    pub flushed: u64,
    pub usage: Vec<(NodeId, (u32, u32))>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulated {} ms in {} events", self.simulated.as_millis(), self.events)?;
        writeln!(
            f,
            "Handovers: {} (attach {}, detach {}, refused {}, reverted {}, aborted {}), mean latency {} us",
            self.handovers, self.attaches, self.detaches, self.refused, self.reverted, self.aborted, self.mean_handover_latency_us
        )?;
        for (name, flow) in [("Uplink", &self.uplink), ("Downlink", &self.downlink)] {
            writeln!(
                f,
                "{}: sent {}, delivered {}, duplicates {}, out of order {}",
                name, flow.sent, flow.delivered, flow.duplicates, flow.out_of_order
            )?;
        }
        writeln!(f, "Tunnel: relayed {}, flushed {}", self.relayed, self.flushed)?;
        for (reason, count) in &self.drops {
            writeln!(f, "Dropped ({}): {}", reason, count)?;
        }
        for (station, (current, previous)) in &self.usage {
            writeln!(f, "Usage {}: {} blocks (previous slot {})", station, current, previous)?;
        }
        Ok(())
    }
}
