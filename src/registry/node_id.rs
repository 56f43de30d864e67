//! Node identifiers and the numeric ranges that partition them.
//!
//! Identifiers are dense integers. The range an id falls in encodes what kind of
//! node it names, so a misconfigured topology is caught at registration time:
//!
//! ```text
//! 0              reserved "none" sentinel
//! 1..=1023       base stations
//! 1024           reserved gap
//! 1025..=2048    terminals on the primary technology
//! 2049..=65535   terminals on the secondary technology
//! ```

use serde::Deserialize;
use std::fmt;

/// Lowest base station id.
pub const BASE_STATION_MIN_ID: u32 = 1;
/// Highest base station id.
pub const BASE_STATION_MAX_ID: u32 = 1023;
/// Lowest terminal id (primary technology).
pub const TERMINAL_MIN_ID: u32 = 1025;
/// First id of the secondary-technology terminal sub-range.
pub const SECONDARY_TERMINAL_MIN_ID: u32 = 2049;
/// Highest terminal id.
pub const TERMINAL_MAX_ID: u32 = 65535;

/// Opaque node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Reserved sentinel; never registrable.
    pub const NONE: NodeId = NodeId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// The kind implied by the numeric range, if any.
    pub fn range_kind(self) -> Option<NodeKind> {
        match self.0 {
            BASE_STATION_MIN_ID..=BASE_STATION_MAX_ID => Some(NodeKind::BaseStation),
            TERMINAL_MIN_ID..=TERMINAL_MAX_ID => Some(NodeKind::Terminal),
            _ => None,
        }
    }

    pub fn is_base_station(self) -> bool {
        self.range_kind() == Some(NodeKind::BaseStation)
    }

    pub fn is_terminal(self) -> bool {
        self.range_kind() == Some(NodeKind::Terminal)
    }

    /// Whether a terminal id lies in the secondary-technology sub-range.
    pub fn in_secondary_range(self) -> bool {
        (SECONDARY_TERMINAL_MIN_ID..=TERMINAL_MAX_ID).contains(&self.0)
    }

    /// Native leg of a terminal id, derived from its sub-range.
    pub fn native_leg(self) -> Leg {
        if self.in_secondary_range() { Leg::Secondary } else { Leg::Primary }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// What a registered node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    BaseStation,
    Terminal,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::BaseStation => write!(f, "base station"),
            NodeKind::Terminal => write!(f, "terminal"),
        }
    }
}

/// Radio technology a serving relationship, session or engine applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Leg {
    Primary,
    Secondary,
}

impl Leg {
    pub const ALL: [Leg; 2] = [Leg::Primary, Leg::Secondary];

    pub const fn index(self) -> usize {
        match self {
            Leg::Primary => 0,
            Leg::Secondary => 1,
        }
    }

    pub fn from_secondary_flag(is_secondary: bool) -> Self {
        if is_secondary { Leg::Secondary } else { Leg::Primary }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Primary => write!(f, "primary"),
            Leg::Secondary => write!(f, "secondary"),
        }
    }
}

/// One value per leg, indexed by [`Leg`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerLeg<T>([T; 2]);

impl<T> PerLeg<T> {
    pub fn new(primary: T, secondary: T) -> Self {
        Self([primary, secondary])
    }

    pub fn get(&self, leg: Leg) -> &T {
        &self.0[leg.index()]
    }

    pub fn get_mut(&mut self, leg: Leg) -> &mut T {
        &mut self.0[leg.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Leg, &T)> {
        Leg::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Leg, &mut T)> {
        Leg::ALL.into_iter().zip(self.0.iter_mut())
    }
}

/// Handle to a node's owning module in the network's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleRef(pub usize);
