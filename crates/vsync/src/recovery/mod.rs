//! # Fault Recovery
//!
//! Keeps the log of delivered application messages, turns it into numbered
//! checkpoints, and hands checkpoints to hosts that fall behind.
//!
//! ```text
//! stable delivery ──► log (clock order) ──threshold──► checkpoint cycle
//!                                                        │
//!                       Checkpoint<ID>.bin + counter ◄───┘
//!                                │
//!                 recover_checkpoint(from) ──► RecoveryPacket ──► add_missing_checkpoints
//! ```
//!
//! Persistence is best effort: a failed write is logged at `error` level and
//! the in-memory state carries on. Only the view manager decides when a
//! checkpoint is taken; members adopt the ID it broadcasts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use vsync_types::CheckpointId;

use crate::config::GroupConfig;
use crate::message::Delivery;
use crate::{VsyncError, VsyncResult};

mod identity;
mod store;

pub use identity::Identity;
pub use store::RecoveryStore;

/// A numbered, immutable snapshot of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    /// Deliveries in clock order.
    pub entries: Vec<Delivery>,
}

#[derive(Debug)]
struct RecoveryState {
    log: BTreeSet<Delivery>,
    checkpoints: BTreeMap<CheckpointId, Checkpoint>,
    /// ID the next checkpoint will take.
    counter: CheckpointId,
    /// Bumped every time the log is cleared.
    generation: u64,
    /// Generation the threshold watcher last fired for.
    fired: Option<u64>,
    closed: bool,
}

impl RecoveryState {
    fn clear_log(&mut self) {
        self.log.clear();
        self.generation += 1;
    }
}

// ============================================================================
// Fault Recovery
// ============================================================================

#[derive(Debug)]
pub struct FaultRecovery {
    threshold: usize,
    store: RecoveryStore,
    state: Mutex<RecoveryState>,
    changed: Condvar,
}

impl FaultRecovery {
    /// Opens the recovery directory and reloads what it holds.
    ///
    /// Unreadable checkpoint files are logged and skipped; the host then
    /// recovers them from the group.
    pub fn open(config: &GroupConfig) -> Self {
        let store = RecoveryStore::new(&config.recovery_dir);

        let checkpoints = store.load_checkpoints().unwrap_or_else(|e| {
            error!(dir = %store.dir().display(), error = %e, "failed to reload checkpoints");
            Vec::new()
        });
        let persisted_counter = store.read_counter().unwrap_or_else(|e| {
            error!(error = %e, "failed to read checkpoint counter");
            None
        });

        let past_last = checkpoints
            .last()
            .map_or(CheckpointId::ZERO, |c| c.id.next());
        let counter = persisted_counter.unwrap_or(CheckpointId::ZERO).max(past_last);

        if !checkpoints.is_empty() {
            info!(
                checkpoints = checkpoints.len(),
                next = %counter,
                "recovery state reloaded"
            );
        }

        Self {
            threshold: config.log_threshold.max(1),
            store,
            state: Mutex::new(RecoveryState {
                log: BTreeSet::new(),
                checkpoints: checkpoints.into_iter().map(|c| (c.id, c)).collect(),
                counter,
                generation: 0,
                fired: None,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn store(&self) -> &RecoveryStore {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Log
    // ------------------------------------------------------------------------

    /// Appends a stable delivery to the log.
    pub fn log_message(&self, delivery: Delivery) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.log.insert(delivery);
        if state.log.len() >= self.threshold {
            self.changed.notify_all();
        }
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().expect("lock poisoned").log.len()
    }

    /// Blocks until the log reaches the threshold.
    ///
    /// Fires once per log generation: after firing, it waits for the log to
    /// be cleared and refilled. Returns false once closed.
    pub fn wait_for_threshold(&self) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        let mut state = self
            .changed
            .wait_while(state, |s| {
                !s.closed && (s.log.len() < self.threshold || s.fired == Some(s.generation))
            })
            .expect("lock poisoned");
        if state.closed {
            return false;
        }
        state.fired = Some(state.generation);
        true
    }

    /// Runs the threshold watcher: calls `notify` every time the log fills
    /// up, until closed or until `notify` returns false.
    pub fn run_watcher(&self, notify: impl Fn() -> bool) {
        while self.wait_for_threshold() {
            debug!(threshold = self.threshold, "log threshold reached");
            if !notify() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Turns the log into the next checkpoint.
    ///
    /// Returns `None` (and changes nothing) if the log is empty.
    pub fn do_checkpoint(&self) -> Option<CheckpointId> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.log.is_empty() {
            info!("checkpoint skipped: log is empty");
            return None;
        }

        let id = state.counter;
        let checkpoint = Checkpoint {
            id,
            entries: state.log.iter().cloned().collect(),
        };
        state.counter = id.next();
        self.persist(&checkpoint, state.counter);
        state.checkpoints.insert(id, checkpoint);
        state.clear_log();

        info!(checkpoint = %id, "checkpoint taken");
        Some(id)
    }

    /// Applies a checkpoint the view manager took.
    ///
    /// The local log becomes checkpoint `id` (unless it is empty or the ID
    /// is already held) and the counter moves past `id`.
    pub fn adopt_checkpoint(&self, id: CheckpointId) {
        let mut state = self.state.lock().expect("lock poisoned");
        let counter = state.counter.max(id.next());

        if !state.log.is_empty() && !state.checkpoints.contains_key(&id) {
            let checkpoint = Checkpoint {
                id,
                entries: state.log.iter().cloned().collect(),
            };
            self.persist(&checkpoint, counter);
            state.checkpoints.insert(id, checkpoint);
        } else if counter != state.counter {
            self.persist_counter(counter);
        }

        state.counter = counter;
        state.clear_log();
        debug!(checkpoint = %id, next = %counter, "checkpoint adopted");
    }

    /// Every checkpoint with an ID at or above `from`, in ID order.
    ///
    /// # Errors
    ///
    /// [`VsyncError::CheckpointNotFound`] if there is none.
    pub fn recover_checkpoint(&self, from: CheckpointId) -> VsyncResult<Vec<Checkpoint>> {
        let state = self.state.lock().expect("lock poisoned");
        let found: Vec<Checkpoint> = state.checkpoints.range(from..).map(|(_, c)| c.clone()).collect();
        if found.is_empty() {
            return Err(VsyncError::CheckpointNotFound(from));
        }
        Ok(found)
    }

    /// Merges checkpoints received from the group.
    ///
    /// Returns the deliveries of the checkpoints that were new here, in
    /// checkpoint order. The local log is cleared: the group's checkpoints
    /// supersede it.
    pub fn add_missing_checkpoints(&self, checkpoints: Vec<Checkpoint>) -> Vec<Delivery> {
        let mut state = self.state.lock().expect("lock poisoned");

        let mut added: Vec<Checkpoint> = checkpoints
            .into_iter()
            .filter(|c| !state.checkpoints.contains_key(&c.id))
            .collect();
        added.sort_by_key(|c| c.id);
        added.dedup_by_key(|c| c.id);

        if let Some(last) = added.last() {
            state.counter = state.counter.max(last.id.next());
        }
        for checkpoint in &added {
            if let Err(e) = self.store.write_checkpoint(checkpoint) {
                error!(checkpoint = %checkpoint.id, error = %e, "failed to persist recovered checkpoint");
            }
        }
        self.persist_counter(state.counter);
        state.clear_log();

        info!(
            recovered = added.len(),
            next = %state.counter,
            "missing checkpoints added"
        );

        let mut deliveries = Vec::new();
        for checkpoint in added {
            deliveries.extend(checkpoint.entries.iter().cloned());
            state.checkpoints.insert(checkpoint.id, checkpoint);
        }
        deliveries
    }

    /// Deliveries recorded since checkpoint `from`: every checkpoint at or
    /// above it, then the current log.
    pub fn replay(&self, from: CheckpointId) -> Vec<Delivery> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .checkpoints
            .range(from..)
            .flat_map(|(_, c)| c.entries.iter().cloned())
            .chain(state.log.iter().cloned())
            .collect()
    }

    /// ID the next checkpoint will take.
    pub fn counter(&self) -> CheckpointId {
        self.state.lock().expect("lock poisoned").counter
    }

    /// Moves the counter forward to at least `to` (taken from a newer view).
    pub fn advance_counter(&self, to: CheckpointId) {
        let mut state = self.state.lock().expect("lock poisoned");
        if to > state.counter {
            state.counter = to;
            self.persist_counter(to);
        }
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointId> {
        let state = self.state.lock().expect("lock poisoned");
        state.checkpoints.keys().next_back().copied()
    }

    pub fn checkpoint_ids(&self) -> Vec<CheckpointId> {
        let state = self.state.lock().expect("lock poisoned");
        state.checkpoints.keys().copied().collect()
    }

    /// Saves the identity a restarted host will come back with.
    pub fn persist_identity(&self, identity: &Identity) {
        if let Err(e) = self.store.write_identity(identity) {
            error!(error = %e, "failed to persist identity");
        }
    }

    /// Releases the threshold watcher.
    pub fn close(&self) {
        self.state.lock().expect("lock poisoned").closed = true;
        self.changed.notify_all();
    }

    fn persist(&self, checkpoint: &Checkpoint, next: CheckpointId) {
        if let Err(e) = self.store.write_checkpoint(checkpoint) {
            error!(checkpoint = %checkpoint.id, error = %e, "failed to persist checkpoint");
        }
        self.persist_counter(next);
    }

    fn persist_counter(&self, next: CheckpointId) {
        if let Err(e) = self.store.write_counter(next) {
            error!(next = %next, error = %e, "failed to persist checkpoint counter");
        }
    }
}
