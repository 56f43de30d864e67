use embassy_time::{Duration, Instant};
use std::collections::HashMap;
use std::fmt;

use crate::error::HandoverError;
use crate::registry::{Leg, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detaching,
    Attaching,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Detaching => write!(f, "detaching"),
            Phase::Attaching => write!(f, "attaching"),
        }
    }
}

/// One handover in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoverSession {
    pub terminal: NodeId,
    pub leg: Leg,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    pub marker: u64,
    pub detach: Duration,
    pub attach: Duration,
    pub phase: Phase,
    pub started_at: Instant,
}

impl HandoverSession {
    /// Total time from trigger to completion.
    pub fn latency(&self) -> Duration {
        match (self.source, self.target) {
            (Some(_), Some(_)) => self.detach + self.attach,
            (None, _) => self.attach,
            (Some(_), None) => self.detach,
        }
    }

    pub fn first_phase(&self) -> Phase {
        if self.source.is_some() { Phase::Detaching } else { Phase::Attaching }
    }

    /// Delay of the current phase.
    pub fn phase_duration(&self) -> Duration {
        match self.phase {
            Phase::Detaching => self.detach,
            Phase::Attaching => self.attach,
        }
    }

    /// Whether the current phase is the final one.
    pub fn is_last_phase(&self) -> bool {
        self.phase == Phase::Attaching || self.target.is_none()
    }
}

/// Active handover sessions, at most one per terminal across all legs.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<NodeId, HandoverSession>,
    next_marker: u64,
    completed: u64,
}

pub struct SessionRequest {
    pub terminal: NodeId,
    pub leg: Leg,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    pub detach: Duration,
    pub attach: Duration,
    pub now: Instant,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, request: SessionRequest) -> Result<&HandoverSession, HandoverError> {
        if let Some(active) = self.sessions.get(&request.terminal) {
            return Err(HandoverError::SessionAlreadyActive {
                terminal: request.terminal,
                marker: active.marker,
            });
        }
        self.next_marker += 1;
        let mut session = HandoverSession {
            terminal: request.terminal,
            leg: request.leg,
            source: request.source,
            target: request.target,
            marker: self.next_marker,
            detach: request.detach,
            attach: request.attach,
            phase: Phase::Detaching,
            started_at: request.now,
        };
        session.phase = session.first_phase();
        Ok(self.sessions.entry(request.terminal).or_insert(session))
    }

    pub fn get(&self, terminal: NodeId) -> Option<&HandoverSession> {
        self.sessions.get(&terminal)
    }

    pub fn is_active(&self, terminal: NodeId) -> bool {
        self.sessions.contains_key(&terminal)
    }

    /// Session of `terminal`, provided its marker is `marker`.
    pub fn current_mut(&mut self, terminal: NodeId, marker: u64) -> Result<&mut HandoverSession, HandoverError> {
        self.sessions
            .get_mut(&terminal)
            .filter(|s| s.marker == marker)
            .ok_or(HandoverError::StaleSession { terminal, marker })
    }

    pub fn end(&mut self, terminal: NodeId, marker: u64) -> Result<HandoverSession, HandoverError> {
        self.current_mut(terminal, marker)?;
        self.completed += 1;
        self.sessions.remove(&terminal).ok_or(HandoverError::StaleSession { terminal, marker })
    }

    /// Drop a session without completing it.
    pub fn abort(&mut self, terminal: NodeId) -> Option<HandoverSession> {
        self.sessions.remove(&terminal)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UE: NodeId = NodeId::new(2050);

    fn request(leg: Leg, source: Option<u32>, target: Option<u32>) -> SessionRequest {
        SessionRequest {
            terminal: UE,
            leg,
            source: source.map(NodeId::new),
            target: target.map(NodeId::new),
            detach: Duration::from_millis(2),
            attach: Duration::from_millis(3),
            now: Instant::from_ticks(0),
        }
    }

    #[test]
    fn second_session_for_a_terminal_is_refused() {
        let mut table = SessionTable::new();
        let marker = table.begin(request(Leg::Primary, Some(1), Some(2))).unwrap().marker;
        let err = table.begin(request(Leg::Secondary, Some(3), Some(4))).unwrap_err();
        assert_eq!(err, HandoverError::SessionAlreadyActive { terminal: UE, marker });
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn latency_and_phases_depend_on_endpoints() {
        let mut table = SessionTable::new();
        let full = table.begin(request(Leg::Primary, Some(1), Some(2))).unwrap().clone();
        assert_eq!(full.latency(), Duration::from_millis(5));
        assert_eq!(full.phase, Phase::Detaching);
        assert!(!full.is_last_phase());
        table.end(UE, full.marker).unwrap();

        let attach_only = table.begin(request(Leg::Primary, None, Some(2))).unwrap().clone();
        assert_eq!(attach_only.latency(), Duration::from_millis(3));
        assert_eq!(attach_only.phase, Phase::Attaching);
        table.end(UE, attach_only.marker).unwrap();

        let detach_only = table.begin(request(Leg::Primary, Some(1), None)).unwrap().clone();
        assert_eq!(detach_only.latency(), Duration::from_millis(2));
        assert!(detach_only.is_last_phase());
    }

    #[test]
    fn markers_increase_and_stale_markers_are_rejected() {
        let mut table = SessionTable::new();
        let first = table.begin(request(Leg::Primary, Some(1), Some(2))).unwrap().marker;
        table.end(UE, first).unwrap();
        let second = table.begin(request(Leg::Primary, Some(2), Some(1))).unwrap().marker;
        assert!(second > first);
        assert_eq!(table.end(UE, first), Err(HandoverError::StaleSession { terminal: UE, marker: first }));
        assert!(table.end(UE, second).is_ok());
        assert_eq!(table.completed(), 2);
    }
}
