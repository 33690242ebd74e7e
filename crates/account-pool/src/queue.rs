//! Bounded FIFO of account IDs ready for checkout

use std::collections::VecDeque;

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    AlreadyQueued,
    /// At capacity; the ID was not queued.
    Full,
}

/// Availability queue.
///
/// Holds IDs only; the pool's account map is authoritative for status, so
/// a popped ID may be stale and callers re-check it. Mutated only under the
/// pool's write lock.
#[derive(Debug)]
pub struct AvailabilityQueue {
    items: VecDeque<String>,
    capacity: usize,
}

impl AvailabilityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Push without blocking. Duplicates are refused so an ID can never be
    /// handed out twice from one queue pass.
    pub fn try_push(&mut self, id: &str) -> Push {
        if self.contains(id) {
            return Push::AlreadyQueued;
        }
        if self.items.len() >= self.capacity {
            return Push::Full;
        }
        self.items.push_back(id.to_string());
        Push::Queued
    }

    pub fn pop(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|queued| queued == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
