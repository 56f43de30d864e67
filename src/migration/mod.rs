//! Buffer migration.
//!
//! At the end of a handover the terminal's link-layer state moves from the
//! losing base station to the gaining one: buffers at the source and the
//! terminal's mirror set keyed by the source are destroyed, then fresh buffers
//! are created at the target and a new mirror set at the terminal. Every stack
//! involved is resolved before anything is touched, so a failure leaves all
//! state as it was.
//!
//! ## Module Organization
//!
//! - `layers`: the `BufferLayer` trait and the three buffer-owning layers
//! - `stack`: `ProtocolStack`, one per node, fanning out to its layers

pub mod layers;
pub mod stack;

pub use layers::{BufferLayer, Reordered, SEQUENCE_MODULUS};
pub use stack::ProtocolStack;

use crate::error::MigrationError;
use crate::registry::{NodeId, NodeRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub terminal: NodeId,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    /// Layer buffer sets destroyed at the source and the terminal.
    pub destroyed: usize,
    /// Peer buffer sets created at the target and the terminal.
    pub created: usize,
}

fn stack_index(registry: &NodeRegistry, stacks: &[ProtocolStack], node: NodeId) -> Result<usize, MigrationError> {
    registry
        .link_layer(node)
        .map(|module| module.0)
        .filter(|idx| stacks.get(*idx).is_some_and(|s| s.owner() == node))
        .ok_or(MigrationError::MissingStack(node))
}

/// Move `terminal`'s buffers from `source` to `target`.
///
/// # Parameters
///
/// * `registry` - resolves each node to its cached link-layer module
/// * `stacks` - protocol stack arena indexed by link-layer module
/// * `terminal` - terminal being handed over
/// * `source` - losing station, `None` for an initial attach
/// * `target` - gaining station, `None` for a pure detach
///
/// # Returns
///
/// A report of what was destroyed and created, or [`MigrationError::MissingStack`]
/// with no state changed.
pub fn migrate(
    registry: &NodeRegistry,
    stacks: &mut [ProtocolStack],
    terminal: NodeId,
    source: Option<NodeId>,
    target: Option<NodeId>,
) -> Result<MigrationReport, MigrationError> {
    let terminal_idx = stack_index(registry, stacks, terminal)?;
    let source_idx = source.map(|s| stack_index(registry, stacks, s)).transpose()?;
    let target_idx = target.map(|t| stack_index(registry, stacks, t)).transpose()?;

    let mut report = MigrationReport {
        terminal,
        source,
        target,
        destroyed: 0,
        created: 0,
    };

    if let (Some(source), Some(idx)) = (source, source_idx) {
        report.destroyed += stacks[idx].destroy_buffers(terminal);
        report.destroyed += stacks[terminal_idx].destroy_buffers(source);
    }
    if let (Some(target), Some(idx)) = (target, target_idx) {
        stacks[idx].create_buffers(terminal);
        stacks[terminal_idx].create_buffers(target);
        report.created += 2;
    }

    log::debug!(
        "Migrated buffers of {} from {:?} to {:?}: {} destroyed, {} created",
        terminal,
        source,
        target,
        report.destroyed,
        report.created
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{Direction, Packet};
    use crate::registry::{ModuleRef, NodeKind};
    use embassy_time::Instant;

    const BS1: NodeId = NodeId::new(1);
    const BS2: NodeId = NodeId::new(2);
    const UE: NodeId = NodeId::new(1025);

    fn setup() -> (NodeRegistry, Vec<ProtocolStack>) {
        let mut registry = NodeRegistry::new();
        let mut stacks = Vec::new();
        for (idx, (id, kind)) in [(BS1, NodeKind::BaseStation), (BS2, NodeKind::BaseStation), (UE, NodeKind::Terminal)]
            .into_iter()
            .enumerate()
        {
            registry.register(id, kind, ModuleRef(idx), false).unwrap();
            registry.cache_link_layer(id, ModuleRef(idx)).unwrap();
            stacks.push(ProtocolStack::new(id));
        }
        (registry, stacks)
    }

    #[test]
    fn handover_leaves_no_orphaned_buffers() {
        let (registry, mut stacks) = setup();
        migrate(&registry, &mut stacks, UE, None, Some(BS1)).unwrap();
        for seq in 0..5 {
            let packet = Packet::new(seq, UE, Direction::Downlink, seq, 100, Instant::from_ticks(0));
            stacks[0].transmit(UE, packet);
        }

        let report = migrate(&registry, &mut stacks, UE, Some(BS1), Some(BS2)).unwrap();
        assert_eq!(report.destroyed, 6);
        assert_eq!(report.created, 2);

        assert!(!stacks[0].has_any_buffers(UE));
        assert!(!stacks[2].has_any_buffers(BS1));
        assert!(stacks[1].has_buffers(UE));
        assert!(stacks[2].has_buffers(BS2));
        assert_eq!(stacks[1].sequencing.state(UE).map(|s| s.next_tx), Some(0));
        assert_eq!(stacks[1].reordering.expected(UE), Some(0));
        assert_eq!(stacks[2].peers(), vec![BS2]);
    }

    #[test]
    fn missing_stack_changes_nothing() {
        let (mut registry, mut stacks) = setup();
        migrate(&registry, &mut stacks, UE, None, Some(BS1)).unwrap();
        let stranger = NodeId::new(9);
        registry.register(stranger, NodeKind::BaseStation, ModuleRef(9), false).unwrap();

        let err = migrate(&registry, &mut stacks, UE, Some(BS1), Some(stranger)).unwrap_err();
        assert_eq!(err, MigrationError::MissingStack(stranger));
        assert!(stacks[0].has_buffers(UE));
        assert!(stacks[2].has_buffers(BS1));
    }

    #[test]
    fn pure_detach_only_destroys() {
        let (registry, mut stacks) = setup();
        migrate(&registry, &mut stacks, UE, None, Some(BS2)).unwrap();
        let report = migrate(&registry, &mut stacks, UE, Some(BS2), None).unwrap();
        assert_eq!(report.created, 0);
        assert!(stacks.iter().all(|s| s.peers().is_empty()));
    }
}
