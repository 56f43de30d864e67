//! Cellular mobility simulator.
//!
//! Simulates the radio-access side of a cellular network and the machinery that
//! moves a terminal between base stations without losing, duplicating or
//! misordering in-flight data.
//!
//! Components, bottom-up:
//! - `registry`: node directory, serving links, addresses, forwarding entries
//! - `gate`: per-packet deliver / tunnel / hold decisions at the IP boundary
//! - `handover`: per-terminal, per-leg decision engine and session table
//! - `migration`: per-peer protocol buffers and their transfer between stations
//! - `simulation`: the network, its event loop and the run report

pub mod common;
pub mod error;
pub mod gate;
pub mod handover;
pub mod migration;
pub mod registry;
pub mod scheduler;
pub mod simulation;

pub use error::{Error, ErrorClass, Result};
