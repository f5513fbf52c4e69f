//! Discrete-event queue
//!
//! A binary heap of timestamped events. Ordering is total: earlier
//! simulated time first, then higher priority, then insertion order, so
//! two events scheduled for the same instant always dispatch in a
//! deterministic order regardless of heap internals.

use crate::net::packet::Packet;
use crate::time::SimTime;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Dispatch priority for events at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    Normal,
    High,
}

/// What an event asks its destination model to do.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Periodic state advance (kinematics, cache purges, rebroadcasts)
    Update,
    /// A packet starts arriving; opens the reception window
    ReceiveBegin(Box<Packet>),
    /// The reception window closes; the packet is delivered or dropped
    ReceiveEnd(Box<Packet>),
}

/// One scheduled event.
#[derive(Debug, Clone)]
pub struct SimEvent {
    /// When the event fires
    pub time: SimTime,
    pub priority: EventPriority,
    /// Model that produced the event; empty for events injected from
    /// outside the model tree (network traffic, scenario scripts)
    pub source: String,
    /// Destination model instance name
    pub dest: String,
    /// Insertion order, assigned by the queue
    seq: u64,
    pub payload: EventPayload,
}

impl SimEvent {
    pub fn new(time: SimTime, priority: EventPriority, dest: &str, payload: EventPayload) -> Self {
        Self {
            time,
            priority,
            source: String::new(),
            dest: dest.to_string(),
            seq: 0,
            payload,
        }
    }

    /// Tag the event with the model that produced it
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }
}

/// Heap entry with the queue's total order. `BinaryHeap` is a max-heap,
/// so the comparison is inverted: the "greatest" entry is the one that
/// should dispatch first.
#[derive(Debug)]
struct QueuedEvent(SimEvent);

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .time
            .cmp(&self.0.time)
            .then(self.0.priority.cmp(&other.0.priority))
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

/// The simulator's pending-event set.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<QueuedEvent>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event. Same-time, same-priority events dispatch in
    /// the order they were scheduled.
    pub fn schedule(&mut self, mut event: SimEvent) {
        event.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedEvent(event));
    }

    /// Firing time of the next event, if any
    pub fn next_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|e| e.0.time)
    }

    /// Pop the next event if it fires at or before `now`
    pub fn pop_due(&mut self, now: SimTime) -> Option<SimEvent> {
        if self.next_time()? <= now {
            self.heap.pop().map(|e| e.0)
        } else {
            None
        }
    }

    /// Pop the next event unconditionally
    pub fn pop(&mut self) -> Option<SimEvent> {
        self.heap.pop().map(|e| e.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(secs: u64, priority: EventPriority, dest: &str) -> SimEvent {
        SimEvent::new(SimTime::from_secs(secs), priority, dest, EventPayload::Update)
    }

    #[test]
    fn test_time_then_priority_then_insertion() {
        let mut q = EventQueue::new();
        q.schedule(event(5, EventPriority::High, "a"));
        q.schedule(event(5, EventPriority::Low, "b"));
        q.schedule(event(3, EventPriority::Low, "c"));

        assert_eq!(q.pop().unwrap().dest, "c");
        assert_eq!(q.pop().unwrap().dest, "a");
        assert_eq!(q.pop().unwrap().dest, "b");
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_ties_dispatch_in_scheduling_order() {
        let mut q = EventQueue::new();
        for name in ["first", "second", "third"] {
            q.schedule(event(1, EventPriority::Normal, name));
        }
        assert_eq!(q.pop().unwrap().dest, "first");
        assert_eq!(q.pop().unwrap().dest, "second");
        assert_eq!(q.pop().unwrap().dest, "third");
    }

    #[test]
    fn test_pop_due_respects_clock() {
        let mut q = EventQueue::new();
        q.schedule(event(10, EventPriority::Normal, "late"));
        assert!(q.pop_due(SimTime::from_secs(9)).is_none());
        assert_eq!(q.pop_due(SimTime::from_secs(10)).unwrap().dest, "late");
        assert!(q.is_empty());
    }
}
