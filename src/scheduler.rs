//! Logical-time discrete-event scheduler.
//!
//! Events are kept in a `BTreeMap` keyed by `(deadline, sequence)`, so they pop
//! in deadline order and, for equal deadlines, in the order they were armed.
//! Nothing here reads a wall clock: `now` only moves when an event is popped.
//!
//! Timers are ordinary events. Arming one returns a [`TimerHandle`] that can be
//! used to cancel it before it fires.

use embassy_time::{Duration, Instant};
use std::collections::BTreeMap;

/// Cancellable reference to an armed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    at: Instant,
    seq: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> Instant {
        self.at
    }
}

/// Arms and cancels timers of type `T` on behalf of a component that does not
/// own the event loop.
pub trait TimerService<T> {
    fn now(&self) -> Instant;

    /// Fire `timer` after `delay` of logical time.
    fn arm(&mut self, delay: Duration, timer: T) -> TimerHandle;

    /// Cancel an armed timer. Returns false if it already fired or was cancelled.
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

pub struct Scheduler<E> {
    now: Instant,
    queue: BTreeMap<(Instant, u64), E>,
    next_seq: u64,
    dispatched: u64,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now: Instant::from_ticks(0),
            queue: BTreeMap::new(),
            next_seq: 0,
            dispatched: 0,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Arm `event` at an absolute instant. Instants in the past fire "now".
    pub fn schedule_at(&mut self, at: Instant, event: E) -> TimerHandle {
        let at = if at < self.now {
            log::warn!(
                "Event scheduled {} us in the past, firing at current time",
                (self.now - at).as_micros()
            );
            self.now
        } else {
            at
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((at, seq), event);
        TimerHandle { at, seq }
    }

    /// `After(duration, event)`.
    pub fn after(&mut self, delay: Duration, event: E) -> TimerHandle {
        let at = self.now + delay;
        self.schedule_at(at, event)
    }

    /// Remove an armed event, handing it back if it had not fired yet.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<E> {
        self.queue.remove(&(handle.at, handle.seq))
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.queue.contains_key(&(handle.at, handle.seq))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest event and advance logical time to its deadline.
    pub fn pop_next(&mut self) -> Option<(Instant, E)> {
        let ((at, _), event) = self.queue.pop_first()?;
        self.now = at;
        self.dispatched += 1;
        Some((at, event))
    }

    /// Pop the earliest event only if it is due no later than `end`.
    pub fn pop_until(&mut self, end: Instant) -> Option<(Instant, E)> {
        match self.next_deadline() {
            Some(at) if at <= end => self.pop_next(),
            _ => None,
        }
    }

    /// Move time forward without dispatching anything.
    pub fn advance_to(&mut self, at: Instant) {
        if at > self.now {
            self.now = at;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of events popped so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}

impl<E, T> TimerService<T> for Scheduler<E>
where
    T: Into<E>,
{
    fn now(&self) -> Instant {
        self.now
    }

    fn arm(&mut self, delay: Duration, timer: T) -> TimerHandle {
        self.after(delay, timer.into())
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        Scheduler::cancel(self, handle).is_some()
    }
}
