//! The simulated network and its event loop.
//!
//! High-level flow of each dispatched event:
//! 1) Pop the earliest event from the scheduler (logical time jumps to it).
//! 2) Run its handler to completion: beacon rounds feed the handover engines,
//!    handover timers drive sessions, traffic ticks create packets, backhaul
//!    arrivals hit the base-station gates.
//! 3) Drain the outbox: air deliveries pass through both protocol stacks,
//!    tunnel relays and handover commands reach the peer station's gate.
//!
//! Downlink packets leave the core network towards the forwarding target as
//! soon as a handover is triggered (path switch), and otherwise towards the
//! terminal's next hop.

use embassy_time::{Duration, Instant};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::geometry::{Bounds, advance, distance};
use super::signal_calculations::{PathLossParameters, calculate_coverage_radius, calculate_rssi};
use super::types::{Accounting, Event, FlowStats, RESOURCE_BLOCK_BYTES, Report, StationState, TerminalState};
use crate::common::config::SimulatorConfig;
use crate::common::scene::Scene;
use crate::error::{HandoverError, RegistryError, Result};
use crate::gate::{
    Direction, DownlinkOutcome, DropReason, HandoverCommand, Outbox, OutboxItem, Packet, StationGate, TerminalGate, UplinkOutcome,
};
use crate::handover::{Beacon, EngineStats, HandoverContext, HandoverEngine, HandoverTimer, SessionTable};
use crate::migration::ProtocolStack;
use crate::registry::{Leg, ModuleRef, NodeId, NodeKind, NodeRegistry};
use crate::scheduler::Scheduler;

fn absorb(total: &mut EngineStats, stats: EngineStats) {
    total.triggered += stats.triggered;
    total.completed += stats.completed;
    total.refused += stats.refused;
    total.reverted += stats.reverted;
    total.aborted += stats.aborted;
}

#[derive(Debug, Default, Clone, Copy)]
struct RetiredGateStats {
    relayed: u64,
    flushed: u64,
    dropped_overflow: u64,
}

pub struct Network {
    config: SimulatorConfig,
    path_loss: PathLossParameters,
    bounds: Bounds,
    rng: StdRng,
    scheduler: Scheduler<Event>,
    registry: NodeRegistry,
    sessions: SessionTable,
    stations: BTreeMap<NodeId, StationState>,
    station_gates: BTreeMap<NodeId, StationGate>,
    terminals: BTreeMap<NodeId, TerminalState>,
    engines: BTreeMap<(NodeId, Leg), HandoverEngine>,
    /// Protocol stacks indexed by link-layer module reference.
    stacks: Vec<ProtocolStack>,
    outbox: Outbox,
    accounting: Accounting,
    retired_engines: EngineStats,
    retired_gates: RetiredGateStats,
    next_packet_id: u64,
}

impl Network {
    /// Build the network described by `scene` and schedule its first events.
    ///
    /// # Parameters
    ///
    /// * `scene` - Validated scene
    /// * `config` - Simulator configuration, validated again here
    ///
    /// # Returns
    ///
    /// The network at logical time zero, or the first configuration error
    /// (bad id range, technology mismatch, invalid timing).
    pub fn from_scene(scene: &Scene, config: SimulatorConfig) -> Result<Self> {
        config.validate()?;

        let mut network = Network {
            rng: StdRng::seed_from_u64(config.simulation.seed),
            path_loss: scene.path_loss_parameters.clone(),
            bounds: Bounds {
                top_left: scene.world_top_left,
                bottom_right: scene.world_bottom_right,
            },
            config,
            scheduler: Scheduler::new(),
            registry: NodeRegistry::new(),
            sessions: SessionTable::new(),
            stations: BTreeMap::new(),
            station_gates: BTreeMap::new(),
            terminals: BTreeMap::new(),
            engines: BTreeMap::new(),
            stacks: Vec::new(),
            outbox: Outbox::new(),
            accounting: Accounting::default(),
            retired_engines: EngineStats::default(),
            retired_gates: RetiredGateStats::default(),
            next_packet_id: 0,
        };

        for station in &scene.base_stations {
            let id = station.node_id;
            let module = network.attach_stack(id);
            network.registry.register(id, NodeKind::BaseStation, module, station.secondary_technology)?;
            network.registry.cache_link_layer(id, module)?;
            for carrier in &station.carriers {
                network.registry.assign_carrier(id, *carrier)?;
            }
            let leg = Leg::from_secondary_flag(station.secondary_technology);
            network.station_gates.insert(id, StationGate::new(id, network.config.gate));
            network.stations.insert(
                id,
                StationState {
                    id,
                    leg,
                    position: station.position,
                    tx_power: station.tx_power,
                },
            );
            log::info!(
                "Base station {} on the {} leg, coverage radius {:.0} m",
                id,
                leg,
                calculate_coverage_radius(station.tx_power, network.config.handover.signal_floor_dbm, &network.path_loss)
            );
            if let Some(at) = station.leave_at_ms {
                network.scheduler.schedule_at(Instant::from_millis(at), Event::Departure { node: id });
            }
        }
        for station in &scene.base_stations {
            if let Some(master) = station.master {
                network.registry.set_master(station.node_id, master)?;
            }
        }

        for terminal in &scene.terminals {
            let id = terminal.node_id;
            let module = network.attach_stack(id);
            network.registry.register(id, NodeKind::Terminal, module, terminal.secondary_technology)?;
            network.registry.cache_link_layer(id, module)?;
            if terminal.dual_connectivity {
                network.registry.enable_dual_connectivity(id)?;
            }
            let legs = network.registry.record(id).map(|r| r.legs()).unwrap_or_default();
            for leg in &legs {
                network.registry.bind(*leg, terminal.address, id)?;
                network
                    .engines
                    .insert((id, *leg), HandoverEngine::new(id, *leg, network.config.handover.clone()));
            }
            for carrier in &terminal.carriers {
                network.registry.assign_carrier(id, *carrier)?;
            }
            for group in &terminal.multicast_groups {
                network.registry.join_multicast(*group, id)?;
            }

            let state = TerminalState::new(
                id,
                terminal.address,
                terminal.position,
                terminal.velocity,
                terminal.traffic,
                TerminalGate::new(id, network.config.gate),
            );
            for direction in [Direction::Uplink, Direction::Downlink] {
                if let Some(interval) = state.interval(direction) {
                    network.scheduler.after(interval, Event::Traffic { terminal: id, direction });
                }
            }
            network.terminals.insert(id, state);
            if let Some(at) = terminal.leave_at_ms {
                network.scheduler.schedule_at(Instant::from_millis(at), Event::Departure { node: id });
            }
            log::info!("Terminal {} at {} with legs {:?}", id, terminal.address, legs);
        }

        network.scheduler.schedule_at(Instant::from_ticks(0), Event::BeaconRound);
        Ok(network)
    }

    fn attach_stack(&mut self, id: NodeId) -> ModuleRef {
        self.stacks.push(ProtocolStack::new(id));
        ModuleRef(self.stacks.len() - 1)
    }

    fn stack_index(&self, id: NodeId) -> Option<usize> {
        self.registry.link_layer(id).map(|m| m.0).filter(|idx| *idx < self.stacks.len())
    }

    pub fn now(&self) -> Instant {
        self.scheduler.now()
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn accounting(&self) -> &Accounting {
        &self.accounting
    }

    pub fn engine(&self, terminal: NodeId, leg: Leg) -> Option<&HandoverEngine> {
        self.engines.get(&(terminal, leg))
    }

    pub fn station_gate(&self, station: NodeId) -> Option<&StationGate> {
        self.station_gates.get(&station)
    }

    pub fn terminal(&self, terminal: NodeId) -> Option<&TerminalState> {
        self.terminals.get(&terminal)
    }

    pub fn stack(&self, id: NodeId) -> Option<&ProtocolStack> {
        self.stack_index(id).map(|idx| &self.stacks[idx])
    }

    /// Run the configured duration from the current time.
    pub fn run(&mut self) -> Result<Report> {
        let end = self.now() + self.config.simulation.duration();
        self.run_until(end)?;
        Ok(self.report())
    }

    /// Dispatch every event due no later than `end`, then move time to `end`.
    pub fn run_until(&mut self, end: Instant) -> Result<()> {
        while let Some((_, event)) = self.scheduler.pop_until(end) {
            self.handle(event)?;
            self.apply_outbox();
        }
        self.scheduler.advance_to(end);
        Ok(())
    }

    fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::BeaconRound => {
                self.beacon_round();
                self.scheduler.after(self.config.simulation.beacon_period(), Event::BeaconRound);
            }
            Event::Handover(timer) => self.handover_timer(timer)?,
            Event::Traffic { terminal, direction } => self.traffic_tick(terminal, direction),
            Event::BackhaulArrival { station, packet } => self.backhaul_arrival(station, packet),
            Event::Departure { node } => self.unregister_node(node)?,
        }
        Ok(())
    }

    fn beacon_round(&mut self) {
        let seconds = self.config.simulation.beacon_period().as_micros() as f64 / 1_000_000.0;
        if self.now().as_ticks() > 0 {
            for terminal in self.terminals.values_mut() {
                (terminal.position, terminal.velocity) = advance(terminal.position, terminal.velocity, seconds, &self.bounds);
            }
        }
        self.registry.advance_slot();

        let now = self.now();
        for ((terminal_id, leg), engine) in self.engines.iter_mut() {
            let Some(terminal) = self.terminals.get(terminal_id) else {
                continue;
            };
            for station in self.stations.values().filter(|s| s.leg == *leg) {
                let d = distance(&terminal.position, &station.position);
                let strength_dbm = calculate_rssi(d, station.tx_power, &self.path_loss, &mut self.rng);
                if strength_dbm < self.path_loss.noise_floor {
                    continue;
                }
                engine.on_beacon(
                    &mut self.scheduler,
                    Beacon {
                        source: station.id,
                        strength_dbm,
                        at: now,
                    },
                );
            }
        }
    }

    fn handover_timer(&mut self, timer: HandoverTimer) -> Result<()> {
        let unknown = HandoverError::UnknownEngine {
            terminal: timer.terminal,
            leg: timer.leg,
        };
        let Some(engine) = self.engines.get_mut(&(timer.terminal, timer.leg)) else {
            return Err(unknown.into());
        };
        let Some(terminal) = self.terminals.get_mut(&timer.terminal) else {
            return Err(unknown.into());
        };
        let mut ctx = HandoverContext {
            timers: &mut self.scheduler,
            registry: &mut self.registry,
            sessions: &mut self.sessions,
            terminal_gate: &mut terminal.gate,
            station_gates: &mut self.station_gates,
            stacks: &mut self.stacks,
            outbox: &mut self.outbox,
        };
        if let Some(completion) = engine.on_timer(&mut ctx, timer)? {
            self.accounting.completed(completion);
        }
        Ok(())
    }

    fn traffic_tick(&mut self, id: NodeId, direction: Direction) {
        let now = self.now();
        let Some(terminal) = self.terminals.get_mut(&id) else {
            log::trace!("Traffic tick for departed terminal {}", id);
            return;
        };
        let Some(interval) = terminal.interval(direction) else {
            return;
        };
        let flow_seq = terminal.next_flow_seq(direction);
        let packet = Packet::new(self.next_packet_id, id, direction, flow_seq, terminal.traffic.packet_size, now);
        let address = terminal.address;
        self.next_packet_id += 1;
        self.accounting.sent(&packet);

        match direction {
            Direction::Uplink => {
                if let Some(terminal) = self.terminals.get_mut(&id) {
                    if let UplinkOutcome::Dropped(reason) = terminal.gate.send(&self.registry, packet, &mut self.outbox) {
                        self.accounting.dropped(reason);
                    }
                }
            }
            Direction::Downlink => self.route_downlink(address, packet),
        }
        self.scheduler.after(interval, Event::Traffic { terminal: id, direction });
    }

    /// Core network routing of a downlink packet towards a base station.
    fn route_downlink(&mut self, address: Ipv4Addr, packet: Packet) {
        let Some(terminal) = self.registry.resolve(address) else {
            self.accounting.dropped(DropReason::Unresolved);
            return;
        };
        let station = match self.registry.forwarding_entry(terminal) {
            Some(entry) => Some(entry.target),
            None => self.registry.next_hop(terminal),
        };
        let Some(station) = station else {
            self.accounting.dropped(DropReason::Unattached);
            return;
        };
        self.scheduler
            .after(self.config.simulation.backhaul_delay(), Event::BackhaulArrival { station, packet });
    }

    fn backhaul_arrival(&mut self, station: NodeId, packet: Packet) {
        let Some(gate) = self.station_gates.get_mut(&station) else {
            self.accounting.dropped(DropReason::StaleRoute);
            return;
        };
        let terminal = packet.terminal;
        if let DownlinkOutcome::Dropped(reason) = gate.receive(&self.registry, packet, terminal, &mut self.outbox) {
            self.accounting.dropped(reason);
        }
    }

    /// Deliver every queued side effect, including any produced on the way.
    fn apply_outbox(&mut self) {
        while let Some(item) = self.outbox.pop() {
            match item {
                OutboxItem::Air { packet, from, to } => self.transfer_over_air(packet, from, to),
                OutboxItem::Relay { packet, to, terminal, .. } => match self.station_gates.get_mut(&to) {
                    Some(gate) => gate.receive_tunneled(packet, terminal),
                    None => self.accounting.dropped(DropReason::StaleRoute),
                },
                OutboxItem::Command { from, to, command } => match command {
                    HandoverCommand::Prepare { terminal, source } => match self.station_gates.get_mut(&to) {
                        Some(gate) => gate.start_holding(terminal, Some(source)),
                        None => log::warn!("Prepare for {} from {} to departed station {}", terminal, from, to),
                    },
                    HandoverCommand::Complete { terminal, .. } => {
                        log::debug!("{}: handover of {} confirmed by {}", to, terminal, from);
                        self.accounting.handover_acks += 1;
                    }
                },
            }
        }
    }

    /// One PDU over the air: transmit side of `from`, receive side of `to`.
    fn transfer_over_air(&mut self, packet: Packet, from: NodeId, to: NodeId) {
        let (Some(tx), Some(rx)) = (self.stack_index(from), self.stack_index(to)) else {
            self.accounting.dropped(DropReason::NoBuffers);
            return;
        };
        let Some((sn, pdu)) = self.stacks[tx].transmit(to, packet) else {
            self.accounting.dropped(DropReason::NoBuffers);
            return;
        };
        let station = if from.is_base_station() { from } else { to };
        let blocks = pdu.size.div_ceil(RESOURCE_BLOCK_BYTES) as u32;

        let received = self.stacks[rx].receive(from, sn, pdu);
        self.stacks[tx].acknowledge(to, sn);
        let Some(reordered) = received else {
            self.accounting.dropped(DropReason::NoBuffers);
            return;
        };
        self.registry.record_usage(station, blocks);
        if reordered.duplicate {
            self.accounting.link_duplicates += 1;
        }
        for delivered in &reordered.released {
            self.accounting.delivered(delivered);
        }
    }

    /// Remove a node from the network.
    ///
    /// Handovers involving the node are aborted, its gates and engines are
    /// dropped, the registry cascade removes every cross-reference, and buffer
    /// state keyed by the node is destroyed on every remaining stack.
    pub fn unregister_node(&mut self, id: NodeId) -> Result<()> {
        let kind = self.registry.kind(id).ok_or(RegistryError::NotRegistered(id))?;
        match kind {
            NodeKind::Terminal => {
                let keys: Vec<(NodeId, Leg)> = self.engines.keys().filter(|(t, _)| *t == id).copied().collect();
                for key in keys {
                    if let Some(mut engine) = self.engines.remove(&key) {
                        engine.cancel_timers(&mut self.scheduler);
                        absorb(&mut self.retired_engines, engine.stats());
                    }
                }
                if let Some(session) = self.sessions.abort(id) {
                    log::warn!("Terminal {} left during handover {}", id, session.marker);
                }
                self.registry.remove_forwarding(id);
                for gate in self.station_gates.values_mut() {
                    gate.discard(id);
                }
                if let Some(mut terminal) = self.terminals.remove(&id) {
                    terminal.gate.discard();
                }
            }
            NodeKind::BaseStation => {
                for ((terminal_id, _), engine) in self.engines.iter_mut() {
                    let Some(terminal) = self.terminals.get_mut(terminal_id) else {
                        continue;
                    };
                    let mut ctx = HandoverContext {
                        timers: &mut self.scheduler,
                        registry: &mut self.registry,
                        sessions: &mut self.sessions,
                        terminal_gate: &mut terminal.gate,
                        station_gates: &mut self.station_gates,
                        stacks: &mut self.stacks,
                        outbox: &mut self.outbox,
                    };
                    engine.forget_station(&mut ctx, id);
                }
                if let Some(gate) = self.station_gates.remove(&id) {
                    let stats = gate.stats();
                    self.retired_gates.relayed += stats.relayed;
                    self.retired_gates.flushed += stats.flushed;
                    self.retired_gates.dropped_overflow += stats.dropped_overflow;
                }
                self.stations.remove(&id);
            }
        }

        let own_stack = self.stack_index(id);
        let removed = self.registry.unregister(id)?;
        if let Some(idx) = own_stack {
            self.stacks[idx].clear();
        }
        for stack in self.stacks.iter_mut() {
            stack.destroy_buffers(id);
        }
        log::info!(
            "{} {} left: {} addresses, {} serving links, {} forwarding entries removed",
            removed.record.kind,
            id,
            removed.addresses_removed,
            removed.serving_cleared,
            removed.forwarding_removed
        );
        Ok(())
    }

    pub fn report(&self) -> Report {
        let mut engines = self.retired_engines;
        for engine in self.engines.values() {
            absorb(&mut engines, engine.stats());
        }

        let completions = self.accounting.completions();
        let handovers: Vec<_> = completions.iter().filter(|c| c.source.is_some() && c.target.is_some()).collect();
        let mean_handover_latency_us = if handovers.is_empty() {
            0
        } else {
            handovers.iter().map(|c| c.latency.as_micros()).sum::<u64>() / handovers.len() as u64
        };

        let mut uplink = FlowStats::default();
        let mut downlink = FlowStats::default();
        for ((_, direction), flow) in self.accounting.flows() {
            let total = match direction {
                Direction::Uplink => &mut uplink,
                Direction::Downlink => &mut downlink,
            };
            total.sent += flow.sent;
            total.delivered += flow.delivered;
            total.duplicates += flow.duplicates;
            total.out_of_order += flow.out_of_order;
        }

        let mut drops = self.accounting.drops().clone();
        let mut overflow = self.retired_gates.dropped_overflow;
        overflow += self.terminals.values().map(|t| t.gate.stats().dropped_overflow).sum::<u64>();
        overflow += self.station_gates.values().map(|g| g.stats().dropped_overflow).sum::<u64>();
        if overflow > 0 {
            *drops.entry(DropReason::Overflow).or_insert(0) += overflow;
        }

        Report {
            simulated: Duration::from_ticks(self.now().as_ticks()),
            events: self.scheduler.dispatched(),
            handovers: handovers.len() as u64,
            attaches: completions.iter().filter(|c| c.source.is_none()).count() as u64,
            detaches: completions.iter().filter(|c| c.target.is_none()).count() as u64,
            refused: engines.refused,
            reverted: engines.reverted,
            aborted: engines.aborted,
            mean_handover_latency_us,
            uplink,
            downlink,
            link_duplicates: self.accounting.link_duplicates,
            drops,
            relayed: self.retired_gates.relayed + self.station_gates.values().map(|g| g.stats().relayed).sum::<u64>(),
            flushed: self.retired_gates.flushed + self.station_gates.values().map(|g| g.stats().flushed).sum::<u64>(),
            usage: self.stations.keys().map(|id| (*id, self.registry.usage(*id))).collect(),
        }
    }

    /// Stop the run: cancel outstanding work and tear the registry down.
    pub fn shutdown(&mut self) {
        if !self.sessions.is_empty() {
            log::info!("Shutting down with {} handover sessions in flight", self.sessions.len());
        }
        let keys: Vec<(NodeId, Leg)> = self.engines.keys().copied().collect();
        for key in keys {
            if let Some(engine) = self.engines.get_mut(&key) {
                engine.cancel_timers(&mut self.scheduler);
            }
        }
        self.outbox.clear();
        for stack in self.stacks.iter_mut() {
            stack.clear();
        }
        self.registry.teardown();
    }
}
