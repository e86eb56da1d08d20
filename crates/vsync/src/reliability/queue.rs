//! Stable delivery queue.
//!
//! A min-ordered set whose head is only released once it is stable. Entries
//! may arrive in any order; the consumer always sees them in `Ord` order, and
//! never sees an entry while something ordered before it is still waiting
//! for acknowledgments.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::error;

#[derive(Debug)]
struct QueueState<T> {
    entries: BTreeMap<T, bool>,
    closed: bool,
}

impl<T: Ord + Clone> QueueState<T> {
    fn pop_stable_head(&mut self) -> Option<T> {
        match self.entries.first_key_value() {
            Some((_, true)) => self.entries.pop_first().map(|(item, _)| item),
            _ => None,
        }
    }
}

/// Thread-safe priority queue with a stability gate on its head.
#[derive(Debug)]
pub struct StableQueue<T> {
    state: Mutex<QueueState<T>>,
    changed: Condvar,
}

impl<T: Ord + Clone> Default for StableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> StableQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Inserts an unstable entry. An entry already present keeps its flag.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.entries.entry(item).or_insert(false);
    }

    /// Inserts an entry that may be delivered as soon as it is the head.
    pub fn add_stable(&self, item: T) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.entries.insert(item, true);
        self.changed.notify_all();
    }

    /// Flags a queued entry as stable.
    ///
    /// Marking twice is harmless. Marking an entry that is not queued logs
    /// an error and changes nothing.
    pub fn mark_stable(&self, item: &T) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.entries.get_mut(item) {
            Some(stable) => {
                *stable = true;
                self.changed.notify_all();
                true
            }
            None => {
                error!("stable mark for an entry that is not queued");
                false
            }
        }
    }

    /// Drops an entry regardless of its stability.
    pub fn remove(&self, item: &T) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        let removed = state.entries.remove(item).is_some();
        if removed {
            // The next entry may be stable already.
            self.changed.notify_all();
        }
        removed
    }

    /// Blocks until the smallest entry exists and is stable, then removes
    /// and returns it. Returns `None` once the queue is closed.
    pub fn retrieve_stable(&self) -> Option<T> {
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.pop_stable_head() {
                return Some(item);
            }
            state = self.changed.wait(state).expect("lock poisoned");
        }
    }

    /// Like [`StableQueue::retrieve_stable`], giving up after `timeout`.
    pub fn retrieve_stable_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.pop_stable_head() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .expect("lock poisoned")
                .0;
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .entries
            .contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every consumer; subsequent retrievals return `None`.
    pub fn close(&self) {
        self.state.lock().expect("lock poisoned").closed = true;
        self.changed.notify_all();
    }
}
