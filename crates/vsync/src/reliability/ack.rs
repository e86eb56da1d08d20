//! Acknowledgment bookkeeping.
//!
//! One record per message that is not yet stable at this host:
//!
//! ```text
//! message id ──► { origin, received, { recipient ──► acked } }
//! ```
//!
//! `received` distinguishes "the message is here, waiting for the others'
//! acks" from "an ack overtook the message itself". A record is complete
//! once `received` is set and every recipient has acked.
//!
//! Acks for unknown messages are absorbed by lazily creating a record, so
//! reordering between links never loses an acknowledgment.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;
use vsync_types::{HostId, MessageId};

#[derive(Debug, Clone)]
struct AckRecord {
    origin: HostId,
    received: bool,
    acked: HashMap<HostId, bool>,
}

impl AckRecord {
    fn new(origin: HostId, received: bool, recipients: &[HostId]) -> Self {
        Self {
            origin,
            received,
            acked: recipients.iter().map(|h| (*h, false)).collect(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received && self.acked.values().all(|acked| *acked)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<MessageId, AckRecord>,
    closed: bool,
}

/// What [`AckTracker::forget_host`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostPurge {
    /// Records originated by the forgotten host; they were removed.
    pub dropped: Vec<MessageId>,
    /// Records that became complete once the host stopped being awaited.
    pub completed: Vec<MessageId>,
}

/// Thread-safe map of outstanding acknowledgments.
#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<TrackerState>,
    emptied: Condvar,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a message this host just sent.
    pub fn track_outgoing(&self, id: MessageId, origin: HostId, recipients: &[HostId]) {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .records
            .insert(id, AckRecord::new(origin, true, recipients));
    }

    /// Registers a received message. Acks that arrived earlier are kept.
    pub fn track_incoming(&self, id: MessageId, origin: HostId, recipients: &[HostId]) {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .records
            .entry(id)
            .and_modify(|record| record.received = true)
            .or_insert_with(|| AckRecord::new(origin, true, recipients));
    }

    /// Applies an ack from `acker`.
    ///
    /// Creates the record (not yet received) if the message itself has not
    /// arrived. Acks from hosts that are not recipients are ignored.
    pub fn receive_ack(
        &self,
        id: MessageId,
        origin: HostId,
        acker: HostId,
        recipients: &[HostId],
    ) {
        let mut state = self.state.lock().expect("lock poisoned");
        let record = state
            .records
            .entry(id)
            .or_insert_with(|| AckRecord::new(origin, false, recipients));

        match record.acked.get_mut(&acker) {
            Some(flag) => *flag = true,
            None => trace!(message = %id, acker = %acker, "ack from non-recipient ignored"),
        }
    }

    pub fn is_complete(&self, id: MessageId) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.records.get(&id).is_some_and(AckRecord::is_complete)
    }

    /// Recipients that have not acknowledged yet.
    pub fn missing(&self, id: MessageId) -> Vec<HostId> {
        let state = self.state.lock().expect("lock poisoned");
        let mut missing: Vec<HostId> = state
            .records
            .get(&id)
            .map(|record| {
                record
                    .acked
                    .iter()
                    .filter(|(_, acked)| !**acked)
                    .map(|(host, _)| *host)
                    .collect()
            })
            .unwrap_or_default();
        missing.sort();
        missing
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .records
            .contains_key(&id)
    }

    /// Deletes a record, waking stabilization waiters when none remain.
    pub fn remove(&self, id: MessageId) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        let removed = state.records.remove(&id).is_some();
        if state.records.is_empty() {
            self.emptied.notify_all();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until no records remain. Returns false if the tracker was
    /// closed while waiting.
    pub fn wait_until_empty(&self) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        let state = self
            .emptied
            .wait_while(state, |s| !s.closed && !s.records.is_empty())
            .expect("lock poisoned");
        state.records.is_empty()
    }

    /// Like [`AckTracker::wait_until_empty`] with an upper bound.
    pub fn wait_until_empty_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("lock poisoned");
        while !state.closed && !state.records.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .emptied
                .wait_timeout(state, deadline - now)
                .expect("lock poisoned")
                .0;
        }
        state.records.is_empty()
    }

    /// Stops waiting for `host`.
    ///
    /// Records the host originated are dropped; the host is struck from the
    /// recipient set of every other record.
    pub fn forget_host(&self, host: HostId) -> HostPurge {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut purge = HostPurge::default();

        state.records.retain(|id, record| {
            if record.origin == host {
                purge.dropped.push(*id);
                return false;
            }
            if record.acked.remove(&host).is_some() && record.is_complete() {
                purge.completed.push(*id);
            }
            true
        });

        if state.records.is_empty() {
            self.emptied.notify_all();
        }
        purge
    }

    /// Releases every waiter; later waits return immediately.
    pub fn close(&self) {
        self.state.lock().expect("lock poisoned").closed = true;
        self.emptied.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn outgoing_completes_when_every_recipient_acks() {
        let tracker = AckTracker::new();
        let me = HostId::generate();
        let (a, b) = (HostId::generate(), HostId::generate());
        let id = MessageId::generate();

        tracker.track_outgoing(id, me, &[a, b]);
        tracker.receive_ack(id, me, a, &[a, b]);
        assert!(!tracker.is_complete(id));
        assert_eq!(tracker.missing(id), vec![b]);

        tracker.receive_ack(id, me, b, &[a, b]);
        assert!(tracker.is_complete(id));
        assert!(tracker.missing(id).is_empty());
    }

    #[test]
    fn ack_before_message_creates_unreceived_record() {
        let tracker = AckTracker::new();
        let origin = HostId::generate();
        let peer = HostId::generate();
        let id = MessageId::generate();

        tracker.receive_ack(id, origin, peer, &[peer]);
        assert!(tracker.contains(id));
        assert!(!tracker.is_complete(id));

        tracker.track_incoming(id, origin, &[peer]);
        assert!(tracker.is_complete(id));
    }

    #[test]
    fn incoming_without_other_recipients_is_complete() {
        let tracker = AckTracker::new();
        let id = MessageId::generate();

        tracker.track_incoming(id, HostId::generate(), &[]);
        assert!(tracker.is_complete(id));
    }

    #[test]
    fn duplicate_and_foreign_acks_are_absorbed() {
        let tracker = AckTracker::new();
        let me = HostId::generate();
        let peer = HostId::generate();
        let id = MessageId::generate();

        tracker.track_outgoing(id, me, &[peer]);
        tracker.receive_ack(id, me, HostId::generate(), &[peer]);
        assert!(!tracker.is_complete(id));

        tracker.receive_ack(id, me, peer, &[peer]);
        tracker.receive_ack(id, me, peer, &[peer]);
        assert!(tracker.is_complete(id));
    }

    #[test]
    fn wait_until_empty_returns_immediately_when_empty() {
        let tracker = AckTracker::new();
        assert!(tracker.wait_until_empty());
    }

    #[test]
    fn remove_wakes_stabilization_waiter() {
        let tracker = Arc::new(AckTracker::new());
        let me = HostId::generate();
        let ids: Vec<MessageId> = (0..3).map(|_| MessageId::generate()).collect();
        for id in &ids {
            tracker.track_outgoing(*id, me, &[]);
        }

        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait_until_empty())
        };

        for id in ids.iter().rev() {
            assert!(tracker.is_complete(*id));
            tracker.remove(*id);
        }
        assert!(waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn wait_with_timeout_gives_up() {
        let tracker = AckTracker::new();
        tracker.track_outgoing(MessageId::generate(), HostId::generate(), &[HostId::generate()]);

        assert!(!tracker.wait_until_empty_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn forgetting_a_host_drops_its_messages_and_unblocks_others() {
        let tracker = AckTracker::new();
        let me = HostId::generate();
        let dead = HostId::generate();
        let live = HostId::generate();

        let from_dead = MessageId::generate();
        tracker.track_incoming(from_dead, dead, &[live]);

        let waiting_on_dead = MessageId::generate();
        tracker.track_outgoing(waiting_on_dead, me, &[dead, live]);
        tracker.receive_ack(waiting_on_dead, me, live, &[dead, live]);

        let unrelated = MessageId::generate();
        tracker.track_outgoing(unrelated, me, &[live]);

        let purge = tracker.forget_host(dead);

        assert_eq!(purge.dropped, vec![from_dead]);
        assert_eq!(purge.completed, vec![waiting_on_dead]);
        assert!(!tracker.contains(from_dead));
        assert!(!tracker.is_complete(unrelated));
    }

    #[test]
    fn close_releases_waiters() {
        let tracker = Arc::new(AckTracker::new());
        tracker.track_outgoing(MessageId::generate(), HostId::generate(), &[HostId::generate()]);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait_until_empty())
        };
        tracker.close();

        assert!(!waiter.join().expect("waiter panicked"));
    }
}
