//! Scene and configuration loading shared by the binary and the simulation.

pub mod config;
pub mod scene;
