//! Packet continuity gate.
//!
//! Sits between the IP layer and the radio stack on both ends of a link and
//! decides, per packet, whether to deliver now, tunnel to a peer base station,
//! or hold until an attachment settles.
//!
//! ## Module Organization
//!
//! - `packet`: packets, directions, origins and drop reasons
//! - `queue`: bounded hold and tunnel queues
//! - `outbox`: radio and tunnel traits plus the ordered outbox implementing them
//! - `terminal`: uplink gate
//! - `station`: downlink gate

pub mod outbox;
pub mod packet;
pub mod queue;
pub mod station;
pub mod terminal;

pub use outbox::{HandoverCommand, InterStationTunnel, Outbox, OutboxItem, RadioLink};
pub use packet::{Direction, DropReason, Origin, Packet};
pub use queue::{OverflowPolicy, PacketQueue, QueueConfig, TunnelQueue};
pub use station::{DownlinkOutcome, StationGate, StationGateStats};
pub use terminal::{TerminalGate, TerminalGateStats, UplinkOutcome};
