//! Bounded FIFO of requests waiting for placement.
//!
//! The queue never grows past its capacity: an insert into a full queue is
//! rejected back to the submitter, nothing is dropped from the tail.

use std::collections::VecDeque;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("pending queue is full ({capacity} requests)")]
    Full { capacity: usize },
}

/// Configuration for the pending queue.
#[derive(Debug, Clone, Copy)]
pub struct PendingQueueConfig {
    pub capacity: usize,
}

impl Default for PendingQueueConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

pub struct PendingQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: PartialEq> PendingQueue<T> {
    pub fn new(config: PendingQueueConfig) -> Self {
        Self { entries: VecDeque::with_capacity(config.capacity.min(1024)), capacity: config.capacity }
    }

    /// Append to the tail. Returns the position the entry landed at.
    pub fn try_push(&mut self, entry: T) -> Result<usize, QueueError> {
        if self.is_full() {
            return Err(QueueError::Full { capacity: self.capacity });
        }
        self.entries.push_back(entry);
        Ok(self.entries.len() - 1)
    }

    /// Remove an entry wherever it sits. Order of the rest is preserved.
    pub fn remove(&mut self, entry: &T) -> bool {
        match self.entries.iter().position(|e| e == entry) {
            Some(idx) => self.entries.remove(idx).is_some(),
            None => false,
        }
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.entries.retain(keep);
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn position(&self, entry: &T) -> Option<usize> {
        self.entries.iter().position(|e| e == entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
