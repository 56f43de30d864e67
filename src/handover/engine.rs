//! Per-terminal, per-leg handover state machine.

use embassy_time::{Duration, Instant};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

use super::session::{Phase, SessionRequest, SessionTable};
use crate::error::Result;
use crate::gate::{HandoverCommand, InterStationTunnel, Outbox, StationGate, TerminalGate};
use crate::migration::{self, ProtocolStack};
use crate::registry::{Leg, NodeId, NodeRegistry};
use crate::scheduler::{TimerHandle, TimerService};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HandoverConfig {
    /// Delay between choosing a candidate and triggering, in microseconds.
    pub settle_delay_us: u64,
    pub detach_delay_us: u64,
    pub attach_delay_us: u64,
    /// Margin used when `hysteresis_factor` is zero.
    pub fixed_margin_db: f64,
    /// When non-zero the margin is `|R| / hysteresis_factor`.
    pub hysteresis_factor: f64,
    /// Beacons weaker than this are not usable.
    pub signal_floor_dbm: f64,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            settle_delay_us: 10,
            detach_delay_us: 2_000,
            attach_delay_us: 3_000,
            fixed_margin_db: 3.0,
            hysteresis_factor: 0.0,
            signal_floor_dbm: -110.0,
        }
    }
}

impl HandoverConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_micros(self.settle_delay_us)
    }

    pub fn detach_delay(&self) -> Duration {
        Duration::from_micros(self.detach_delay_us)
    }

    pub fn attach_delay(&self) -> Duration {
        Duration::from_micros(self.attach_delay_us)
    }

    pub fn margin(&self, strength_dbm: f64) -> f64 {
        if self.hysteresis_factor == 0.0 {
            self.fixed_margin_db
        } else {
            strength_dbm.abs() / self.hysteresis_factor
        }
    }
}

/// A periodic beacon as measured by the terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beacon {
    pub source: NodeId,
    pub strength_dbm: f64,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Settle,
    Phase,
}

/// Timer armed by an engine. `marker` is the settle generation for settle
/// timers and the session marker for phase timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoverTimer {
    pub terminal: NodeId,
    pub leg: Leg,
    pub kind: TimerKind,
    pub marker: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Attached(NodeId),
    Unattached,
    /// `None` is a pending detach.
    HandoverPending(Option<NodeId>),
    HandoverInProgress {
        source: Option<NodeId>,
        target: Option<NodeId>,
        phase: Phase,
    },
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Attached(station) => write!(f, "attached to {}", station),
            EngineState::Unattached => write!(f, "unattached"),
            EngineState::HandoverPending(Some(candidate)) => write!(f, "pending towards {}", candidate),
            EngineState::HandoverPending(None) => write!(f, "pending detach"),
            EngineState::HandoverInProgress { source, target, phase } => {
                write!(f, "{} {:?} -> {:?}", phase, source, target)
            }
        }
    }
}

/// Everything a handover touches outside the engine itself.
pub struct HandoverContext<'a> {
    pub timers: &'a mut dyn TimerService<HandoverTimer>,
    pub registry: &'a mut NodeRegistry,
    pub sessions: &'a mut SessionTable,
    pub terminal_gate: &'a mut TerminalGate,
    pub station_gates: &'a mut BTreeMap<NodeId, StationGate>,
    pub stacks: &'a mut [ProtocolStack],
    pub outbox: &'a mut Outbox,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub triggered: u64,
    pub completed: u64,
    pub refused: u64,
    pub reverted: u64,
    pub aborted: u64,
}

/// What a finished handover did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub terminal: NodeId,
    pub leg: Leg,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    pub latency: Duration,
}

pub struct HandoverEngine {
    terminal: NodeId,
    leg: Leg,
    config: HandoverConfig,
    state: EngineState,
    serving: Option<NodeId>,
    serving_strength: f64,
    candidate: Option<NodeId>,
    candidate_strength: f64,
    margin: f64,
    settle_timer: Option<TimerHandle>,
    settle_generation: u64,
    phase_timer: Option<(TimerHandle, u64)>,
    stats: EngineStats,
}

impl HandoverEngine {
    pub fn new(terminal: NodeId, leg: Leg, config: HandoverConfig) -> Self {
        let margin = config.fixed_margin_db;
        Self {
            terminal,
            leg,
            config,
            state: EngineState::Unattached,
            serving: None,
            serving_strength: f64::NEG_INFINITY,
            candidate: None,
            candidate_strength: f64::NEG_INFINITY,
            margin,
            settle_timer: None,
            settle_generation: 0,
            phase_timer: None,
            stats: EngineStats::default(),
        }
    }

    pub fn terminal(&self) -> NodeId {
        self.terminal
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn serving(&self) -> Option<NodeId> {
        self.serving
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    fn is_pending(&self) -> bool {
        matches!(self.state, EngineState::HandoverPending(_))
    }

    fn settled_state(&self) -> EngineState {
        match self.serving {
            Some(station) => EngineState::Attached(station),
            None => EngineState::Unattached,
        }
    }

    fn arm_settle(&mut self, timers: &mut dyn TimerService<HandoverTimer>) {
        if let Some(handle) = self.settle_timer.take() {
            timers.cancel(handle);
        }
        self.settle_generation += 1;
        let timer = HandoverTimer {
            terminal: self.terminal,
            leg: self.leg,
            kind: TimerKind::Settle,
            marker: self.settle_generation,
        };
        self.settle_timer = Some(timers.arm(self.config.settle_delay(), timer));
    }

    fn cancel_settle(&mut self, timers: &mut dyn TimerService<HandoverTimer>) {
        if let Some(handle) = self.settle_timer.take() {
            timers.cancel(handle);
        }
    }

    /// Feed one beacon heard on this engine's leg.
    pub fn on_beacon(&mut self, timers: &mut dyn TimerService<HandoverTimer>, beacon: Beacon) {
        let strength = beacon.strength_dbm;
        let from_serving = Some(beacon.source) == self.serving;

        if matches!(self.state, EngineState::HandoverInProgress { .. }) {
            // Only the stored serving strength moves until the session ends.
            if from_serving {
                self.serving_strength = strength;
                self.margin = self.config.margin(strength);
            }
            return;
        }

        if from_serving {
            let previous = self.serving_strength;
            self.serving_strength = strength;
            self.margin = self.config.margin(strength);

            let floor = self.config.signal_floor_dbm;
            let pending_elsewhere = self.is_pending() && self.candidate != self.serving;
            let stronger_candidate = pending_elsewhere && self.candidate.is_some();
            if pending_elsewhere && strength > previous && strength >= floor {
                log::debug!("{} [{}]: serving {} recovered to {:.1} dBm, dropping candidate", self.terminal, self.leg, beacon.source, strength);
                self.cancel_settle(timers);
                self.candidate = self.serving;
                self.candidate_strength = strength;
                self.state = self.settled_state();
                self.stats.reverted += 1;
            } else if strength < floor && !stronger_candidate {
                log::debug!("{} [{}]: serving {} fell below floor at {:.1} dBm", self.terminal, self.leg, beacon.source, strength);
                self.candidate = None;
                self.candidate_strength = f64::NEG_INFINITY;
                self.state = EngineState::HandoverPending(None);
                self.arm_settle(timers);
            }
            return;
        }

        if strength < self.config.signal_floor_dbm {
            return;
        }
        if self.is_pending() && self.candidate == Some(beacon.source) {
            self.candidate_strength = strength;
            return;
        }

        let best = if self.is_pending() {
            self.candidate_strength
        } else if self.serving.is_some() {
            self.serving_strength
        } else {
            f64::NEG_INFINITY
        };
        if strength > best + self.margin {
            log::debug!(
                "{} [{}]: candidate {} at {:.1} dBm beats {:.1} dBm + {:.1} dB",
                self.terminal,
                self.leg,
                beacon.source,
                strength,
                best,
                self.margin
            );
            self.candidate = Some(beacon.source);
            self.candidate_strength = strength;
            self.state = EngineState::HandoverPending(Some(beacon.source));
            self.arm_settle(timers);
        }
    }

    /// Dispatch a fired timer. Stale settle timers are ignored; a phase timer
    /// that does not match the active session is an invariant violation.
    pub fn on_timer(&mut self, ctx: &mut HandoverContext<'_>, timer: HandoverTimer) -> Result<Option<Completion>> {
        match timer.kind {
            TimerKind::Settle => {
                if self.settle_timer.is_none() || timer.marker != self.settle_generation {
                    log::trace!("{} [{}]: stale settle timer {}", self.terminal, self.leg, timer.marker);
                    return Ok(None);
                }
                self.settle_timer = None;
                self.on_settle(ctx)?;
                Ok(None)
            }
            TimerKind::Phase => self.on_phase(ctx, timer.marker),
        }
    }

    fn on_settle(&mut self, ctx: &mut HandoverContext<'_>) -> Result<()> {
        let EngineState::HandoverPending(candidate) = self.state else {
            return Ok(());
        };
        if candidate == self.serving {
            self.state = self.settled_state();
            return Ok(());
        }

        if let Some(active) = ctx.sessions.get(self.terminal) {
            log::info!(
                "{} [{}]: handover refused, session {} on the {} leg still active",
                self.terminal,
                self.leg,
                active.marker,
                active.leg
            );
            self.candidate = self.serving;
            self.candidate_strength = self.serving_strength;
            self.state = self.settled_state();
            self.stats.refused += 1;
            return Ok(());
        }

        let source = self.serving.filter(|s| ctx.registry.is_registered(*s));
        let target = candidate;
        let session = ctx.sessions.begin(SessionRequest {
            terminal: self.terminal,
            leg: self.leg,
            source,
            target,
            detach: self.config.detach_delay(),
            attach: self.config.attach_delay(),
            now: ctx.timers.now(),
        })?;
        let marker = session.marker;
        let phase = session.phase;
        let delay = session.phase_duration();
        let latency = session.latency();

        log::info!(
            "{} [{}]: handover {} triggered {:?} -> {:?}, expected latency {} us",
            self.terminal,
            self.leg,
            marker,
            source,
            target,
            latency.as_micros()
        );
        self.state = EngineState::HandoverInProgress { source, target, phase };
        self.arm_phase(ctx, delay, marker);
        self.stats.triggered += 1;

        ctx.terminal_gate.start_holding(self.leg, target);
        if let (Some(source), Some(target)) = (source, target) {
            ctx.registry.install_forwarding(source, self.terminal, target)?;
            ctx.outbox.send_command(
                source,
                target,
                HandoverCommand::Prepare {
                    terminal: self.terminal,
                    source,
                },
            );
        }
        Ok(())
    }

    fn arm_phase(&mut self, ctx: &mut HandoverContext<'_>, delay: Duration, marker: u64) {
        let timer = HandoverTimer {
            terminal: self.terminal,
            leg: self.leg,
            kind: TimerKind::Phase,
            marker,
        };
        self.phase_timer = Some((ctx.timers.arm(delay, timer), marker));
    }

    fn on_phase(&mut self, ctx: &mut HandoverContext<'_>, marker: u64) -> Result<Option<Completion>> {
        let session = ctx.sessions.current_mut(self.terminal, marker)?;
        self.phase_timer = None;

        if !session.is_last_phase() {
            session.phase = Phase::Attaching;
            let delay = session.phase_duration();
            let (source, target) = (session.source, session.target);
            log::debug!("{} [{}]: detached, attaching to {:?}", self.terminal, self.leg, target);
            self.state = EngineState::HandoverInProgress {
                source,
                target,
                phase: Phase::Attaching,
            };
            self.arm_phase(ctx, delay, marker);
            return Ok(None);
        }

        let (source, target, latency) = (session.source, session.target, session.latency());
        self.complete(ctx, marker, source, target).map(|_| {
            Some(Completion {
                terminal: self.terminal,
                leg: self.leg,
                source,
                target,
                latency,
            })
        })
    }

    fn complete(&mut self, ctx: &mut HandoverContext<'_>, marker: u64, source: Option<NodeId>, target: Option<NodeId>) -> Result<()> {
        let live_source = source.filter(|s| ctx.registry.is_registered(*s));
        migration::migrate(ctx.registry, ctx.stacks, self.terminal, live_source, target)?;

        if let Some(source) = source {
            ctx.registry.clear_serving_node(self.terminal, source)?;
        }
        if let Some(target) = target {
            ctx.registry.set_serving_node(self.terminal, target)?;
            if let Some(gate) = ctx.station_gates.get_mut(&target) {
                gate.complete_attach(self.terminal, ctx.outbox);
            }
        }
        ctx.terminal_gate.stop_holding(self.leg, ctx.registry, ctx.outbox);
        ctx.registry.remove_forwarding(self.terminal);
        if let (Some(source), Some(target)) = (live_source, target) {
            ctx.outbox.send_command(
                target,
                source,
                HandoverCommand::Complete {
                    terminal: self.terminal,
                    target: Some(target),
                },
            );
        }
        ctx.sessions.end(self.terminal, marker)?;

        self.serving = target;
        self.serving_strength = if target.is_some() { self.candidate_strength } else { f64::NEG_INFINITY };
        self.margin = match target {
            Some(_) => self.config.margin(self.serving_strength),
            None => self.config.fixed_margin_db,
        };
        self.candidate = target;
        self.state = self.settled_state();
        self.stats.completed += 1;
        log::info!("{} [{}]: handover {} complete, now {}", self.terminal, self.leg, marker, self.state);
        Ok(())
    }

    /// Undo an in-flight or pending handover involving `station`, and forget
    /// it as serving node or candidate. Used when `station` leaves the network.
    ///
    /// Returns true if a session was aborted.
    pub fn forget_station(&mut self, ctx: &mut HandoverContext<'_>, station: NodeId) -> bool {
        let mut aborted = false;
        if let EngineState::HandoverInProgress { source, target, .. } = self.state {
            if source == Some(station) || target == Some(station) {
                self.abort(ctx);
                aborted = true;
            }
        }
        if self.serving == Some(station) {
            self.serving = None;
            self.serving_strength = f64::NEG_INFINITY;
        }
        if self.candidate == Some(station) {
            self.candidate = self.serving;
            self.candidate_strength = self.serving_strength;
            if self.is_pending() {
                self.cancel_settle(ctx.timers);
            }
        }
        if !matches!(self.state, EngineState::HandoverInProgress { .. }) {
            self.state = self.settled_state();
        }
        aborted
    }

    /// Abandon the current handover: cancel timers, drop the session, release
    /// gate hold state and the forwarding entry.
    pub fn abort(&mut self, ctx: &mut HandoverContext<'_>) {
        self.cancel_settle(ctx.timers);
        if let Some((handle, _)) = self.phase_timer.take() {
            ctx.timers.cancel(handle);
        }
        let EngineState::HandoverInProgress { target, .. } = self.state else {
            self.state = self.settled_state();
            return;
        };

        if let Some(session) = ctx.sessions.abort(self.terminal) {
            log::warn!("{} [{}]: handover {} aborted", self.terminal, self.leg, session.marker);
        }
        if let Some(gate) = target.and_then(|t| ctx.station_gates.get_mut(&t)) {
            gate.discard(self.terminal);
        }
        ctx.registry.remove_forwarding(self.terminal);
        ctx.terminal_gate.stop_holding(self.leg, ctx.registry, ctx.outbox);
        self.candidate = self.serving;
        self.candidate_strength = self.serving_strength;
        self.state = self.settled_state();
        self.stats.aborted += 1;
    }

    /// Cancel every timer this engine owns. Used when the terminal leaves.
    pub fn cancel_timers(&mut self, timers: &mut dyn TimerService<HandoverTimer>) {
        self.cancel_settle(timers);
        if let Some((handle, _)) = self.phase_timer.take() {
            timers.cancel(handle);
        }
    }
}
