//! Deadline heap: pending timers ordered by expiry instant.
//!
//! A `BinaryHeap` of reverse-ordered entries gives the min-heap; ties on
//! the same instant fire in insertion order so tests observe a
//! deterministic sequence. Cancellation is lazy: cancelled ids are skipped
//! when they surface at the top of the heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::task::TaskId;

/// Identifier of a pending timer, returned by [`DeadlineHeap::insert`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    /// Insertion sequence; the tie-break for equal deadlines.
    seq: u64,
    id: TimerId,
    task: TaskId,
}

// Reverse ordering on (deadline, seq) for a min-heap.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Min-ordered collection of pending timers keyed by expiry instant.
#[derive(Default)]
pub struct DeadlineHeap {
    heap: BinaryHeap<TimerEntry>,
    /// Ids currently present in the heap.
    active: FxHashSet<TimerId>,
    /// Cancelled ids not yet physically removed from the heap.
    cancelled: FxHashSet<TimerId>,
    next_seq: u64,
    next_id: u64,
}

impl DeadlineHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer expiring at `deadline` on behalf of `task`.
    pub fn insert(&mut self, deadline: Instant, task: TaskId) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(TimerEntry {
            deadline,
            seq,
            id,
            task,
        });
        self.active.insert(id);
        id
    }

    /// Cancel a pending timer. Idempotent; unknown or already-fired ids
    /// are ignored.
    pub fn cancel(&mut self, id: TimerId) {
        if self.active.remove(&id) {
            self.cancelled.insert(id);
        }
    }

    /// Remove and return every timer with expiry ≤ `now`, in ascending
    /// expiry order (insertion order for equal instants).
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerId, TaskId)> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.id) {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            let entry = match self.heap.pop() {
                Some(entry) => entry,
                None => break,
            };
            self.active.remove(&entry.id);
            fired.push((entry.id, entry.task));
        }
        fired
    }

    /// The nearest pending deadline, if any. Prunes cancelled entries that
    /// have reached the top of the heap.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.id) {
                self.heap.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    /// Number of pending (non-cancelled) timers.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True when no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
