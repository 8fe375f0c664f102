//! Bounded text queue between the capture and relay workers
//!
//! The capture worker pushes one fragment per resolved key press; the relay
//! worker clears the queue before injecting a keystroke and drains it after
//! the settle delay. The producer never blocks: once the queue is full the
//! oldest fragment is dropped to make room.
//!
//! The mutex is only held while the deque is mutated, never across device or
//! socket I/O.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Capacity used by the daemon
pub const DEFAULT_CAPACITY: usize = 10;

/// Shared handle to the fragment queue.
///
/// Cloning is cheap and yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct RelayQueue {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl RelayQueue {
    /// Create a queue holding at most `capacity` fragments (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a fragment, evicting the oldest one when full
    pub fn push(&self, fragment: String) {
        let mut queue = self.lock();
        while queue.len() >= self.capacity {
            if let Some(evicted) = queue.pop_front() {
                tracing::trace!("Relay queue full, dropping {:?}", evicted);
            }
        }
        queue.push_back(fragment);
    }

    /// Remove and return every fragment in insertion order
    pub fn drain_all(&self) -> Vec<String> {
        self.lock().drain(..).collect()
    }

    /// Remove every fragment and concatenate them in insertion order
    pub fn drain_joined(&self) -> String {
        self.drain_all().concat()
    }

    /// Discard every fragment
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RelayQueue {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
