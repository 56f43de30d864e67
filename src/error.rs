//! Error types for the mobility simulator.
//!
//! Every error in this crate is fatal to the simulation run: a configuration
//! error means the topology is inconsistent, an invariant error means the state
//! machine is broken. Transient conditions (a destination that is mid-removal,
//! a terminal with no serving node) are not errors and surface as `None` from
//! registry lookups instead.

use thiserror::Error;

use crate::registry::{Leg, NodeId, NodeKind};

/// Result type alias for simulator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("handover error: {0}")]
    Handover(#[from] HandoverError),

    #[error("buffer migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Broad classification used when reporting a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Topology or configuration defect detected at the point of use.
    Configuration,
    /// Programming error: a state machine invariant was violated.
    Invariant,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Registry(err) => err.class(),
            Error::Handover(_) | Error::Migration(_) => ErrorClass::Invariant,
            Error::InvalidConfig(_) => ErrorClass::Configuration,
        }
    }
}

/// Node registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node id {id} is outside the {kind} range")]
    RangeMismatch { id: NodeId, kind: NodeKind },

    #[error("node id {0} is already registered")]
    AlreadyOccupied(NodeId),

    #[error("node {id} does not match the {leg} technology")]
    TechnologyMismatch { id: NodeId, leg: Leg },

    #[error("node {0} is not registered")]
    NotRegistered(NodeId),

    #[error("node {id} is not a {expected}")]
    KindMismatch { id: NodeId, expected: NodeKind },

    #[error("terminal {terminal} already has a forwarding entry towards {target}")]
    ForwardingExists { terminal: NodeId, target: NodeId },
}

impl RegistryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RegistryError::NotRegistered(_) | RegistryError::ForwardingExists { .. } => ErrorClass::Invariant,
            _ => ErrorClass::Configuration,
        }
    }
}

/// Handover state machine invariant violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandoverError {
    #[error("terminal {terminal} already has handover session {marker} in progress")]
    SessionAlreadyActive { terminal: NodeId, marker: u64 },

    #[error("timer for session {marker} of terminal {terminal} fired with no matching session")]
    StaleSession { terminal: NodeId, marker: u64 },

    #[error("no handover engine for terminal {terminal} on the {leg} leg")]
    UnknownEngine { terminal: NodeId, leg: Leg },
}

/// Buffer migration failures. Raised before any buffer is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("node {0} has no protocol stack attached")]
    MissingStack(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_the_taxonomy() {
        let range = Error::from(RegistryError::RangeMismatch {
            id: NodeId::new(5),
            kind: NodeKind::Terminal,
        });
        assert_eq!(range.class(), ErrorClass::Configuration);

        let unknown = Error::from(RegistryError::NotRegistered(NodeId::new(7)));
        assert_eq!(unknown.class(), ErrorClass::Invariant);

        let second = Error::from(HandoverError::SessionAlreadyActive {
            terminal: NodeId::new(1025),
            marker: 3,
        });
        assert_eq!(second.class(), ErrorClass::Invariant);
        assert!(second.to_string().contains("#1025"));
    }
}
