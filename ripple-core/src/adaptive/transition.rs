//! Transition Log
//!
//! Every proposal made to an adaptive cell is recorded as a [`Transition`]
//! before the optimizer sees it. The log is a bounded ring: once full, the
//! oldest entry is evicted. Sequence numbers keep increasing across
//! evictions, which lets optimizers fold only what they have not seen yet.

use std::collections::VecDeque;
use std::time::Instant;

use super::signal::ContextSnapshot;
use crate::error::{Error, Result};

/// A recorded proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<T> {
    /// Position in the log's lifetime, starting at 0.
    pub sequence: u64,
    /// Value of the cell when the proposal was made.
    pub from: T,
    /// Proposed value.
    pub to: T,
    pub timestamp: Instant,
    /// Signal readings at the time of the proposal.
    pub context: ContextSnapshot,
}

/// Bounded, append-only history of transitions.
#[derive(Debug, Clone)]
pub struct TransitionLog<T> {
    entries: VecDeque<Transition<T>>,
    capacity: usize,
    next_sequence: u64,
}

impl<T> TransitionLog<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity("transition log capacity"));
        }
        Ok(Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: 0,
        })
    }

    /// Append a transition, evicting the oldest if the log is full.
    pub fn record(&mut self, from: T, to: T, timestamp: Instant, context: ContextSnapshot) -> &Transition<T> {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(Transition {
            sequence,
            from,
            to,
            timestamp,
            context,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Transition<T>> + ExactSizeIterator {
        self.entries.iter()
    }

    /// Transitions whose sequence is at least `sequence`, oldest first.
    pub fn since(&self, sequence: u64) -> impl Iterator<Item = &Transition<T>> {
        let skip = match self.entries.front() {
            Some(first) if sequence > first.sequence => (sequence - first.sequence) as usize,
            _ => 0,
        };
        self.entries.iter().skip(skip)
    }

    pub fn latest(&self) -> Option<&Transition<T>> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of transitions ever recorded, evicted ones included.
    pub fn total_recorded(&self) -> u64 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, values: &[i32]) -> TransitionLog<i32> {
        let mut log = TransitionLog::new(capacity).unwrap();
        let now = Instant::now();
        let mut previous = 0;
        for &value in values {
            log.record(previous, value, now, ContextSnapshot::new());
            previous = value;
        }
        log
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            TransitionLog::<i32>::new(0),
            Err(Error::InvalidCapacity(_))
        ));
    }

    #[test]
    fn evicts_oldest_first() {
        let log = filled(3, &[1, 2, 3, 4, 5]);
        let kept: Vec<i32> = log.iter().map(|t| t.to).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(log.total_recorded(), 5);
        assert_eq!(log.latest().map(|t| t.sequence), Some(4));
        assert_eq!(log.latest().map(|t| t.from), Some(4));
    }

    #[test]
    fn since_skips_consumed_entries() {
        let log = filled(4, &[1, 2, 3, 4, 5, 6]);
        let fresh: Vec<i32> = log.since(4).map(|t| t.to).collect();
        assert_eq!(fresh, vec![5, 6]);

        // Sequences older than the ring start yield the whole ring.
        let all: Vec<u64> = log.since(0).map(|t| t.sequence).collect();
        assert_eq!(all, vec![2, 3, 4, 5]);

        assert_eq!(log.since(6).count(), 0);
    }
}
