//! Fixed-capacity history buffer

use std::collections::vec_deque::{self, VecDeque};

/// Bounded, ordered history that evicts its oldest entry when full
///
/// Storage is allocated once at construction; pushes never reallocate or
/// copy the retained entries.
#[derive(Debug, Clone)]
pub struct RingHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RingHistory<T> {
    /// Create an empty history holding at most `capacity` entries
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one if the buffer was full
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.entries.iter()
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

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> RingHistory<T> {
    /// Copy of the entries from oldest to newest
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}
