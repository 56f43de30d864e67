//! Whole-network scenarios driven through the event loop.

use embassy_time::Instant;

use super::network::Network;
use crate::common::config::SimulatorConfig;
use crate::common::scene::{Scene, parse_scene};
use crate::error::{Error, RegistryError};
use crate::gate::{Direction, DropReason};
use crate::handover::EngineState;
use crate::registry::{Leg, NodeId};

const BS1: NodeId = NodeId::new(1);
const BS2: NodeId = NodeId::new(2);
const NR1: NodeId = NodeId::new(3);
const UE: NodeId = NodeId::new(1025);
const DC_UE: NodeId = NodeId::new(2049);

const PATH_LOSS: &str = r#"
    "path_loss_parameters": {
        "path_loss_exponent": 3.0,
        "shadowing_sigma": 0.0,
        "path_loss_at_reference_distance": 40.0,
        "noise_floor": -120.0
    },
    "world_top_left": { "x": 0.0, "y": 0.0 },
    "world_bottom_right": { "x": 2000.0, "y": 200.0 },
"#;

fn scene(body: &str) -> Scene {
    parse_scene(&format!("{{{}{}}}", PATH_LOSS, body)).unwrap()
}

/// Two primary cells 1500 m apart and one terminal at `x` moving at `speed`.
fn two_cells(x: f64, speed: f64, extra_station: &str) -> Scene {
    scene(&format!(
        r#"
        "base_stations": [
            {{ "node_id": 1, "position": {{ "x": 250.0, "y": 100.0 }}, "tx_power": 43.0{} }},
            {{ "node_id": 2, "position": {{ "x": 1750.0, "y": 100.0 }}, "tx_power": 43.0 }}
        ],
        "terminals": [
            {{
                "node_id": 1025,
                "position": {{ "x": {}, "y": 100.0 }},
                "velocity": {{ "x": {}, "y": 0.0 }},
                "address": "10.0.0.5"
            }}
        ]
        "#,
        extra_station, x, speed
    ))
}

fn at_ms(ms: u64) -> Instant {
    Instant::from_millis(ms)
}

#[test]
fn driving_across_two_cells_keeps_every_flow_in_order() {
    let mut network = Network::from_scene(&two_cells(300.0, 30.0, ""), SimulatorConfig::default()).unwrap();
    network.run_until(at_ms(40_000)).unwrap();
    let report = network.report();

    assert_eq!(report.attaches, 1);
    assert_eq!(report.handovers, 1);
    assert_eq!(report.detaches, 0);
    assert_eq!(network.registry().serving_node(UE), Some(BS2));
    assert!(network.sessions().is_empty());
    assert_eq!(network.engine(UE, Leg::Primary).unwrap().state(), EngineState::Attached(BS2));

    for flow in [report.uplink, report.downlink] {
        assert!(flow.delivered > 1_000);
        assert_eq!(flow.duplicates, 0);
        assert_eq!(flow.out_of_order, 0);
        assert!(flow.sent - flow.delivered <= 1);
    }
    assert_eq!(report.link_duplicates, 0);
    assert!(report.drops.is_empty(), "unexpected drops {:?}", report.drops);
    // The downlink packet sent at the trigger instant still heads for the old cell.
    assert!(report.relayed >= 1);
    assert!(report.flushed >= report.relayed);
    assert_eq!(network.accounting().handover_acks, 1);
    assert!(report.mean_handover_latency_us >= 5_000);
}

#[test]
fn buffers_follow_the_serving_station() {
    let mut network = Network::from_scene(&two_cells(300.0, 30.0, ""), SimulatorConfig::default()).unwrap();
    network.run_until(at_ms(1_000)).unwrap();
    assert!(network.stack(BS1).unwrap().has_buffers(UE));
    assert!(network.stack(UE).unwrap().has_buffers(BS1));
    assert!(!network.stack(BS2).unwrap().has_any_buffers(UE));

    network.run_until(at_ms(40_000)).unwrap();
    assert!(!network.stack(BS1).unwrap().has_any_buffers(UE));
    assert!(!network.stack(UE).unwrap().has_any_buffers(BS1));
    assert!(network.stack(BS2).unwrap().has_buffers(UE));
    assert!(network.stack(UE).unwrap().has_buffers(BS2));
}

#[test]
fn stationary_terminal_never_hands_over() {
    let mut network = Network::from_scene(&two_cells(990.0, 0.0, ""), SimulatorConfig::default()).unwrap();
    network.run_until(at_ms(5_000)).unwrap();
    let report = network.report();
    assert_eq!(report.attaches, 1);
    assert_eq!(report.handovers, 0);
    assert_eq!(network.registry().serving_node(UE), Some(BS1));
}

#[test]
fn departing_serving_station_forces_a_reattach() {
    let scene = two_cells(300.0, 0.0, r#", "leave_at_ms": 1050"#);
    let mut network = Network::from_scene(&scene, SimulatorConfig::default()).unwrap();

    network.run_until(at_ms(1_049)).unwrap();
    assert_eq!(network.registry().serving_node(UE), Some(BS1));

    network.run_until(at_ms(1_060)).unwrap();
    assert!(!network.registry().is_registered(BS1));
    assert!(!network.registry().references(BS1));
    assert_eq!(network.registry().serving_node(UE), None);
    assert!(!network.stack(UE).unwrap().has_any_buffers(BS1));
    assert!(network.station_gate(BS1).is_none());
    assert_eq!(network.engine(UE, Leg::Primary).unwrap().state(), EngineState::Unattached);

    network.run_until(at_ms(2_000)).unwrap();
    let report = network.report();
    assert_eq!(network.registry().serving_node(UE), Some(BS2));
    assert_eq!(report.attaches, 2);
    assert!(report.drops.get(&DropReason::Unattached).copied().unwrap_or(0) > 0);
    let downlink = network.accounting().flow(UE, Direction::Downlink);
    assert_eq!((downlink.duplicates, downlink.out_of_order), (0, 0));
}

#[test]
fn departing_terminal_leaves_no_trace() {
    let scene = scene(
        r#"
        "base_stations": [
            { "node_id": 1, "position": { "x": 250.0, "y": 100.0 }, "tx_power": 43.0 }
        ],
        "terminals": [
            { "node_id": 1025, "position": { "x": 300.0, "y": 100.0 }, "address": "10.0.0.5", "leave_at_ms": 500 }
        ]
        "#,
    );
    let mut network = Network::from_scene(&scene, SimulatorConfig::default()).unwrap();
    network.run_until(at_ms(1_000)).unwrap();

    assert!(!network.registry().is_registered(UE));
    assert!(!network.registry().references(UE));
    assert!(network.registry().served_by(BS1).is_empty());
    assert!(!network.stack(BS1).unwrap().has_any_buffers(UE));
    assert!(network.engine(UE, Leg::Primary).is_none());
    assert!(network.terminal(UE).is_none());
    assert_eq!(network.registry().resolve("10.0.0.5".parse().unwrap()), None);
}

#[test]
fn dual_connectivity_legs_never_overlap_sessions() {
    let scene = scene(
        r#"
        "base_stations": [
            { "node_id": 1, "position": { "x": 250.0, "y": 100.0 }, "tx_power": 43.0 },
            { "node_id": 3, "position": { "x": 260.0, "y": 100.0 }, "tx_power": 30.0,
              "secondary_technology": true, "master": 1 }
        ],
        "terminals": [
            {
                "node_id": 2049,
                "position": { "x": 300.0, "y": 100.0 },
                "secondary_technology": true,
                "dual_connectivity": true,
                "address": "10.0.0.9",
                "traffic": { "uplink_interval_ms": 0, "downlink_interval_ms": 0 }
            }
        ]
        "#,
    );
    let mut network = Network::from_scene(&scene, SimulatorConfig::default()).unwrap();
    for ms in 1..=300 {
        network.run_until(at_ms(ms)).unwrap();
        assert!(network.sessions().len() <= 1);
    }

    let report = network.report();
    assert_eq!(report.attaches, 2);
    assert!(report.refused >= 1);
    assert_eq!(network.registry().serving_node_on(DC_UE, Leg::Primary), Some(BS1));
    assert_eq!(network.registry().serving_node_on(DC_UE, Leg::Secondary), Some(NR1));
    assert_eq!(network.registry().selected_leg(DC_UE), Some(Leg::Secondary));
    assert_eq!(network.registry().master_or_self(NR1), BS1);
}

#[test]
fn terminal_id_in_the_station_range_is_rejected() {
    let scene = scene(
        r#"
        "base_stations": [
            { "node_id": 1, "position": { "x": 250.0, "y": 100.0 }, "tx_power": 43.0 }
        ],
        "terminals": [
            { "node_id": 5, "position": { "x": 300.0, "y": 100.0 }, "address": "10.0.0.5" }
        ]
        "#,
    );
    let err = Network::from_scene(&scene, SimulatorConfig::default()).err().unwrap();
    assert!(matches!(err, Error::Registry(RegistryError::RangeMismatch { .. })));
}

#[test]
fn same_seed_gives_the_same_report() {
    let mut scene = two_cells(300.0, 30.0, "");
    scene.path_loss_parameters.shadowing_sigma = 4.0;
    let mut config = SimulatorConfig::default();
    config.simulation.duration_ms = 30_000;

    let mut first = Network::from_scene(&scene, config.clone()).unwrap();
    let mut second = Network::from_scene(&scene, config).unwrap();
    assert_eq!(first.run().unwrap(), second.run().unwrap());
}

#[test]
fn shutdown_clears_the_registry() {
    let mut network = Network::from_scene(&two_cells(300.0, 30.0, ""), SimulatorConfig::default()).unwrap();
    network.run_until(at_ms(100)).unwrap();
    network.shutdown();
    assert!(network.registry().is_empty());
}
