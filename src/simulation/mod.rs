//! Network simulation core module.
//!
//! This module runs the mobility subsystem end-to-end in logical time. It
//! integrates:
//! - Scene and configuration driven network construction
//! - Beacon rounds feeding the per-terminal handover engines
//! - Straight-line terminal mobility
//! - Constant-bit-rate traffic in both directions with core-network routing
//! - Delivery accounting and the run report
//!
//! ## Module Organization
//!
//! - `types`: Events, per-node runtime state, accounting and the report
//! - `signal_calculations`: Path loss and beacon strength calculations
//! - `geometry`: Distances and motion with reflection at the world edges
//! - `network`: The network owner and its event loop
//!
//! ## Public API
//!
//! The main entry point is `Network::from_scene` followed by `Network::run`.

pub mod geometry;
pub mod network;
pub mod signal_calculations;
pub mod types;

#[cfg(test)]
mod tests;

pub use network::Network;
pub use types::{Event, Report};
