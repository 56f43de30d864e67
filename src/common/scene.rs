//! Scene loading, parsing, and validation logic.
//!
//! A scene describes the world, the propagation model and every node: base
//! stations with their technology leg, carriers and dual-connectivity master,
//! and terminals with their motion, address and traffic profile.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;

use crate::registry::{CarrierId, NodeId};
use crate::simulation::signal_calculations::PathLossParameters;

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneLoadError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for SceneLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneLoadError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            SceneLoadError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneLoadError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for SceneLoadError {}

/// Simple 2D point in meters.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Velocity in meters per second.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Velocity {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BaseStation {
    pub node_id: NodeId,
    pub position: Point,
    /// Transmit power in dBm.
    pub tx_power: f64,
    /// Transmits on the secondary technology.
    #[serde(default)]
    pub secondary_technology: bool,
    /// Primary-leg master of a secondary station.
    #[serde(default)]
    pub master: Option<NodeId>,
    #[serde(default)]
    pub carriers: Vec<CarrierId>,
    /// Leave the network at this time.
    #[serde(default)]
    pub leave_at_ms: Option<u64>,
}

/// Constant-bit-rate traffic. An interval of zero disables that direction.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct TrafficProfile {
    pub uplink_interval_ms: u64,
    pub downlink_interval_ms: u64,
    pub packet_size: usize,
}

impl Default for TrafficProfile {
    fn default() -> Self {
        Self {
            uplink_interval_ms: 20,
            downlink_interval_ms: 10,
            packet_size: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Terminal {
    pub node_id: NodeId,
    pub position: Point,
    #[serde(default)]
    pub velocity: Velocity,
    #[serde(default)]
    pub secondary_technology: bool,
    /// Secondary-technology terminal that can also attach on the primary leg.
    #[serde(default)]
    pub dual_connectivity: bool,
    pub address: Ipv4Addr,
    #[serde(default)]
    pub carriers: Vec<CarrierId>,
    #[serde(default)]
    pub multicast_groups: Vec<u32>,
    #[serde(default)]
    pub traffic: TrafficProfile,
    #[serde(default)]
    pub leave_at_ms: Option<u64>,
}

/// Root structure representing the entire scene.
#[derive(Debug, Deserialize, Clone)]
pub struct Scene {
    pub path_loss_parameters: PathLossParameters,
    /// Top-left corner of the world coordinate system.
    pub world_top_left: Point,
    /// Bottom-right corner of the world coordinate system.
    pub world_bottom_right: Point,
    pub base_stations: Vec<BaseStation>,
    #[serde(default)]
    pub terminals: Vec<Terminal>,
}

/// Load and parse a scene from a file.
///
/// # Parameters
///
/// * `path` - Path to the scene JSON file
///
/// # Returns
///
/// Parsed and validated Scene or an error.
pub fn load_scene(path: &str) -> Result<Scene, SceneLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| SceneLoadError::FileReadError(e.to_string()))?;

    parse_scene(&data)
}

/// Parse and validate a scene from JSON text.
pub fn parse_scene(data: &str) -> Result<Scene, SceneLoadError> {
    let scene: Scene = serde_json::from_str(data)
        .context("Invalid JSON format")
        .map_err(|e| SceneLoadError::ParseError(format!("{:#}", e)))?;

    validate_scene(&scene).map_err(SceneLoadError::ValidationError)?;
    Ok(scene)
}

/// Validate scene configuration.
///
/// Id ranges are left to the node registry, which rejects them at
/// registration with a typed error.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scene(scene: &Scene) -> Result<(), String> {
    const MAX_NODES: usize = 10000;
    const MIN_TX_POWER: f64 = -10.0;
    const MAX_TX_POWER: f64 = 60.0;

    if scene.base_stations.is_empty() {
        return Err("Scene must contain at least one base station".to_string());
    }
    let node_count = scene.base_stations.len() + scene.terminals.len();
    if node_count > MAX_NODES {
        return Err(format!("Node count {} exceeds maximum of {}", node_count, MAX_NODES));
    }

    let (top_left, bottom_right) = (scene.world_top_left, scene.world_bottom_right);
    if bottom_right.x <= top_left.x || bottom_right.y <= top_left.y {
        return Err("World bottom-right corner must lie below and right of the top-left corner".to_string());
    }
    let inside = |p: &Point| p.x >= top_left.x && p.x <= bottom_right.x && p.y >= top_left.y && p.y <= bottom_right.y;

    // Check for duplicate node IDs
    let mut node_ids = HashSet::new();
    let all_ids = scene.base_stations.iter().map(|b| b.node_id).chain(scene.terminals.iter().map(|t| t.node_id));
    for id in all_ids {
        if !node_ids.insert(id) {
            return Err(format!("Duplicate node_id found: {}", id));
        }
    }

    for station in &scene.base_stations {
        if !inside(&station.position) {
            return Err(format!(
                "Base station {} position ({}, {}) is outside the world",
                station.node_id, station.position.x, station.position.y
            ));
        }
        if station.tx_power < MIN_TX_POWER || station.tx_power > MAX_TX_POWER {
            return Err(format!(
                "Base station {} tx_power {} dBm outside realistic range ({} to {} dBm)",
                station.node_id, station.tx_power, MIN_TX_POWER, MAX_TX_POWER
            ));
        }
        if let Some(master) = station.master {
            if !station.secondary_technology {
                return Err(format!("Base station {} has a master but is not a secondary-technology station", station.node_id));
            }
            match scene.base_stations.iter().find(|b| b.node_id == master) {
                Some(m) if !m.secondary_technology => {}
                Some(_) => return Err(format!("Master {} of base station {} must be a primary-technology station", master, station.node_id)),
                None => return Err(format!("Master {} of base station {} does not exist", master, station.node_id)),
            }
        }
    }

    let mut addresses = HashSet::new();
    for terminal in &scene.terminals {
        if !inside(&terminal.position) {
            return Err(format!(
                "Terminal {} position ({}, {}) is outside the world",
                terminal.node_id, terminal.position.x, terminal.position.y
            ));
        }
        if !addresses.insert(terminal.address) {
            return Err(format!("Address {} is assigned to more than one terminal", terminal.address));
        }
        if terminal.dual_connectivity && !terminal.secondary_technology {
            return Err(format!("Terminal {} requests dual connectivity without being a secondary-technology terminal", terminal.node_id));
        }
        let traffic = &terminal.traffic;
        if traffic.packet_size == 0 && (traffic.uplink_interval_ms > 0 || traffic.downlink_interval_ms > 0) {
            return Err(format!("Terminal {} has traffic with a zero packet size", terminal.node_id));
        }
    }

    let params = &scene.path_loss_parameters;
    if params.path_loss_exponent <= 0.0 {
        return Err(format!("Invalid path_loss_exponent {}, must be positive", params.path_loss_exponent));
    }
    if params.shadowing_sigma < 0.0 {
        return Err(format!("Invalid shadowing_sigma {}, must not be negative", params.shadowing_sigma));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = r#"{
        "path_loss_parameters": {
            "path_loss_exponent": 3.0,
            "shadowing_sigma": 0.0,
            "path_loss_at_reference_distance": 40.0,
            "noise_floor": -120.0
        },
        "world_top_left": { "x": 0.0, "y": 0.0 },
        "world_bottom_right": { "x": 2000.0, "y": 500.0 },
        "base_stations": [
            { "node_id": 1, "position": { "x": 250.0, "y": 250.0 }, "tx_power": 43.0, "carriers": [1] },
            { "node_id": 2, "position": { "x": 1750.0, "y": 250.0 }, "tx_power": 43.0 }
        ],
        "terminals": [
            {
                "node_id": 1025,
                "position": { "x": 300.0, "y": 250.0 },
                "velocity": { "x": 30.0, "y": 0.0 },
                "address": "10.0.0.5"
            }
        ]
    }"#;

    #[test]
    fn parses_a_valid_scene_with_defaults() {
        let scene = parse_scene(SCENE).unwrap();
        assert_eq!(scene.base_stations.len(), 2);
        assert_eq!(scene.base_stations[0].carriers, vec![CarrierId(1)]);
        let terminal = &scene.terminals[0];
        assert_eq!(terminal.node_id, NodeId::new(1025));
        assert_eq!(terminal.address, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(terminal.traffic, TrafficProfile::default());
        assert!(!terminal.dual_connectivity);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut scene = parse_scene(SCENE).unwrap();
        scene.terminals[0].node_id = NodeId::new(2);
        let err = validate_scene(&scene).unwrap_err();
        assert!(err.contains("Duplicate node_id"));
    }

    #[test]
    fn rejects_nodes_outside_the_world() {
        let mut scene = parse_scene(SCENE).unwrap();
        scene.terminals[0].position.x = 5000.0;
        assert!(validate_scene(&scene).unwrap_err().contains("outside the world"));
    }

    #[test]
    fn rejects_masters_on_the_wrong_leg() {
        let mut scene = parse_scene(SCENE).unwrap();
        scene.base_stations[1].master = Some(NodeId::new(1));
        assert!(validate_scene(&scene).unwrap_err().contains("not a secondary-technology"));
        scene.base_stations[1].secondary_technology = true;
        assert!(validate_scene(&scene).is_ok());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(parse_scene("{"), Err(SceneLoadError::ParseError(_))));
    }
}
