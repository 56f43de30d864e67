//! Node registry: identifiers, registration records and every cross-node table.
//!
//! ## Module Organization
//!
//! - `node_id`: identifiers, id ranges, node kinds and technology legs
//! - `addressing`: address tables, carriers, multicast groups, usage snapshot
//! - `node_registry`: the registry itself

pub mod addressing;
pub mod node_id;
pub mod node_registry;

pub use addressing::CarrierId;
pub use node_id::{Leg, ModuleRef, NodeId, NodeKind, PerLeg};
pub use node_registry::{ForwardingEntry, NodeRecord, NodeRegistry, Unregistered};
