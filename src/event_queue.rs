//! Time-ordered queue of scheduled MIDI output events.
//!
//! A min-heap keyed by `(pulse, dispatch priority, insertion sequence)`.
//! The priority component guarantees that note-offs landing on the same
//! pulse as note-ons are dispatched first; the sequence number keeps
//! otherwise-equal events in insertion order. The queue never discards:
//! events whose pulse has already passed are still returned by
//! [`pop_due`](EventQueue::pop_due), in order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::engine::PatternId;
use crate::events::MidiMessage;

/// One scheduled output event.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Absolute pulse at which the event is due.
    pub pulse: u64,
    pub message: MidiMessage,
    /// The scheduled pattern that produced this event, if any. Used by
    /// `unschedule` to drop a pattern's still-pending events.
    pub source: Option<PatternId>,
    seq: u64,
}

impl QueuedEvent {
    fn key(&self) -> (u64, u8, u64) {
        (self.pulse, self.message.dispatch_priority(), self.seq)
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    // Reversed so the BinaryHeap max-heap pops the earliest event first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Min-priority queue of [`QueuedEvent`]s.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<QueuedEvent>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `message` at `pulse`, optionally tagged with its source
    /// pattern.
    pub fn push(&mut self, pulse: u64, message: MidiMessage, source: Option<PatternId>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedEvent {
            pulse,
            message,
            source,
            seq,
        });
    }

    /// Remove and return every event due at or before `pulse`, in
    /// increasing `(pulse, priority)` order. Late events are included.
    pub fn pop_due(&mut self, pulse: u64) -> Vec<QueuedEvent> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.pulse > pulse {
                break;
            }
            due.push(self.heap.pop().expect("peeked event must pop"));
        }
        due
    }

    /// Pulse of the earliest pending event, if any.
    pub fn next_pulse(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.pulse)
    }

    /// Drop every pending event produced by `source`.
    pub fn remove_source(&mut self, source: PatternId) {
        let kept: Vec<QueuedEvent> = self
            .heap
            .drain()
            .filter(|e| e.source != Some(source))
            .collect();
        self.heap = kept.into();
    }

    /// Drop every pending event.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on(note: u8) -> MidiMessage {
        MidiMessage::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    fn off(note: u8) -> MidiMessage {
        MidiMessage::NoteOff { channel: 0, note }
    }

    #[test]
    fn pops_in_pulse_order() {
        let mut q = EventQueue::new();
        q.push(48, on(60), None);
        q.push(0, on(61), None);
        q.push(24, on(62), None);

        let due = q.pop_due(100);
        let pulses: Vec<u64> = due.iter().map(|e| e.pulse).collect();
        assert_eq!(pulses, vec![0, 24, 48]);
    }

    #[test]
    fn only_due_events_pop() {
        let mut q = EventQueue::new();
        q.push(10, on(60), None);
        q.push(20, on(61), None);

        assert_eq!(q.pop_due(9).len(), 0);
        assert_eq!(q.pop_due(10).len(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_pulse(), Some(20));
    }

    #[test]
    fn offs_before_ons_at_equal_pulse() {
        let mut q = EventQueue::new();
        // Insert the on first to prove the priority, not insertion order,
        // decides the tie.
        q.push(24, on(60), None);
        q.push(24, off(60), None);
        q.push(24, on(64), None);
        q.push(24, off(64), None);

        let due = q.pop_due(24);
        assert!(matches!(due[0].message, MidiMessage::NoteOff { .. }));
        assert!(matches!(due[1].message, MidiMessage::NoteOff { .. }));
        assert!(matches!(due[2].message, MidiMessage::NoteOn { .. }));
        assert!(matches!(due[3].message, MidiMessage::NoteOn { .. }));
    }

    #[test]
    fn equal_key_events_keep_insertion_order() {
        let mut q = EventQueue::new();
        q.push(5, on(1), None);
        q.push(5, on(2), None);
        q.push(5, on(3), None);

        let notes: Vec<u8> = q
            .pop_due(5)
            .iter()
            .map(|e| match e.message {
                MidiMessage::NoteOn { note, .. } => note,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(notes, vec![1, 2, 3]);
    }

    #[test]
    fn late_events_are_never_dropped() {
        let mut q = EventQueue::new();
        q.push(3, on(60), None);
        // The consumer is already past pulse 3; the event must still come out.
        let due = q.pop_due(100);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].pulse, 3);
    }

    #[test]
    fn remove_source_drops_only_that_pattern() {
        let mut q = EventQueue::new();
        let a = PatternId(1);
        let b = PatternId(2);
        q.push(0, on(60), Some(a));
        q.push(1, on(61), Some(b));
        q.push(2, on(62), Some(a));
        q.push(3, on(63), None);

        q.remove_source(a);
        assert_eq!(q.len(), 2);
        let due = q.pop_due(10);
        assert_eq!(due[0].pulse, 1);
        assert_eq!(due[1].pulse, 3);
    }
}
