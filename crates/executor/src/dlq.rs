use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

/// A bounded, in-memory dead-letter buffer.
///
/// Entries are kept in arrival order. When a push would exceed the capacity,
/// the oldest half of the buffer is evicted first, so bursts of failures
/// cost one large eviction instead of one per push.
///
/// The lock is a standard `Mutex`; no method holds it across an `.await`.
pub struct DeadLetterQueue<T> {
    entries: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create an empty queue holding at most `capacity` entries.
    ///
    /// ```
    /// use conduit_executor::DeadLetterQueue;
    ///
    /// let dlq: DeadLetterQueue<String> = DeadLetterQueue::new(4);
    /// assert!(dlq.is_empty());
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest half when full.
    ///
    /// Returns the number of evicted entries.
    pub fn push(&self, entry: T) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = 0;
        if entries.len() >= self.capacity {
            evicted = (entries.len() / 2).max(1);
            entries.drain(..evicted);
            warn!(
                evicted,
                capacity = self.capacity,
                "dead-letter queue full, evicted oldest entries"
            );
        }
        entries.push_back(entry);
        evicted
    }

    /// Remove and return the first entry matching `predicate`.
    pub fn take_where(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let index = entries.iter().position(predicate)?;
        entries.remove(index)
    }

    pub fn contains_where(&self, predicate: impl Fn(&T) -> bool) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(predicate)
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> DeadLetterQueue<T> {
    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
