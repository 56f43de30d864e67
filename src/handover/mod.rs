//! Handover decision engine.
//!
//! One engine per (terminal, leg) watches beacons, applies hysteresis and runs
//! the timed detach/attach sequence. Sessions are shared across legs so a
//! terminal never has two handovers in flight.
//!
//! ## Module Organization
//!
//! - `session`: handover sessions and the per-terminal session table
//! - `engine`: the state machine and its timer/context plumbing

pub mod engine;
pub mod session;

pub use engine::{
    Beacon, Completion, EngineState, EngineStats, HandoverConfig, HandoverContext, HandoverEngine, HandoverTimer, TimerKind,
};
pub use session::{HandoverSession, Phase, SessionRequest, SessionTable};
