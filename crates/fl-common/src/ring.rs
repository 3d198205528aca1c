//! Fixed-capacity ring buffer
//!
//! FIFO by insertion; when full, a new element overwrites the oldest. Inserts
//! are O(1), snapshots O(n). The buffer itself is not synchronized: owners
//! that share one across tasks wrap it in a single lock and hand out snapshot
//! copies, never live views.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    /// Capacity must be non-zero; a zero-capacity ring can hold nothing and
    /// would make every add a silent drop.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "circular buffer capacity must be non-zero");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, dropping the oldest when the buffer is at capacity.
    pub fn add(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently added item.
    pub fn peek_newest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest item still held.
    pub fn peek_oldest(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> CircularBuffer<T> {
    /// Snapshot copy ordered oldest to newest.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Items whose timestamp (per `selector`) is at or after `cutoff`,
    /// oldest first.
    pub fn items_within<F>(&self, cutoff: DateTime<Utc>, selector: F) -> Vec<T>
    where
        F: Fn(&T) -> DateTime<Utc>,
    {
        self.items
            .iter()
            .filter(|item| selector(item) >= cutoff)
            .cloned()
            .collect()
    }
}
