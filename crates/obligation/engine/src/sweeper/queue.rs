//! Due-time priority queue.
//!
//! A binary min-heap of `(due_at, seq)` plus an index of the live entry per
//! obligation. Rescheduling pushes a fresh entry and bumps the index; stale
//! heap entries are skipped when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use obligation_types::ObligationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    due_at: DateTime<Utc>,
    seq: u64,
    id: ObligationId,
}

// Reversed so the std max-heap pops the earliest entry first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Obligations keyed by their next interesting timestamp.
#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Entry>,
    live: HashMap<ObligationId, (DateTime<Utc>, u64)>,
    next_seq: u64,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` at `due_at`, replacing any existing entry.
    pub fn schedule(&mut self, id: ObligationId, due_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id, (due_at, seq));
        self.heap.push(Entry { due_at, seq, id });
        self.maybe_compact();
    }

    /// Schedule `id` at `due_at` unless it is already due earlier.
    pub fn schedule_earliest(&mut self, id: ObligationId, due_at: DateTime<Utc>) {
        match self.live.get(&id) {
            Some((current, _)) if *current <= due_at => {}
            _ => self.schedule(id, due_at),
        }
    }

    pub fn remove(&mut self, id: &ObligationId) -> bool {
        self.live.remove(id).is_some()
    }

    pub fn contains(&self, id: &ObligationId) -> bool {
        self.live.contains_key(id)
    }

    pub fn due_at(&self, id: &ObligationId) -> Option<DateTime<Utc>> {
        self.live.get(id).map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObligationId> + '_ {
        self.live.keys().copied()
    }

    /// Earliest live due time.
    pub fn next_due(&mut self) -> Option<DateTime<Utc>> {
        self.drop_stale_head();
        self.heap.peek().map(|e| e.due_at)
    }

    /// Pop every obligation due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<ObligationId> {
        let mut due = Vec::new();
        loop {
            self.drop_stale_head();
            match self.heap.peek() {
                Some(entry) if entry.due_at <= now => {
                    let entry = *entry;
                    self.heap.pop();
                    self.live.remove(&entry.id);
                    due.push(entry.id);
                }
                _ => break,
            }
        }
        due
    }

    fn is_live(&self, entry: &Entry) -> bool {
        self.live
            .get(&entry.id)
            .is_some_and(|(_, seq)| *seq == entry.seq)
    }

    fn drop_stale_head(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.is_live(entry) {
                break;
            }
            self.heap.pop();
        }
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.live.len() * 2 {
            let live = &self.live;
            self.heap.retain(|e| live.get(&e.id).is_some_and(|(_, seq)| *seq == e.seq));
        }
    }
}
