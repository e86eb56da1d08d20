//! Retry deadlines for unacknowledged messages.
//!
//! One min-heap of `(deadline, message)` served by one thread, instead of a
//! timer per message. Attempt counts are kept per `(message, recipient)`.
//!
//! ```text
//! send ──► schedule(id, now + interval)
//!             │
//!             ▼  next_due() pops the earliest expired deadline
//!          tick: missing recipients ──► bump(id, host)
//!             │       < max_retries  ──► retransmit
//!             │       ≥ max_retries  ──► declare disconnected
//!             ▼
//!          schedule(id, now + interval) while anything is missing
//! ```
//!
//! Cancelling is lazy: [`RetryScheduler::forget`] drops the counters and a
//! popped deadline for a forgotten message is skipped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use vsync_types::{HostId, MessageId};

#[derive(Debug, Default)]
struct SchedulerState {
    deadlines: BinaryHeap<Reverse<(Instant, MessageId)>>,
    armed: HashSet<MessageId>,
    attempts: HashMap<(MessageId, HostId), u32>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct RetryScheduler {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a retry tick for `id` after `delay`.
    pub fn schedule(&self, id: MessageId, delay: Duration) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return;
        }
        state.armed.insert(id);
        state.deadlines.push(Reverse((Instant::now() + delay, id)));
        self.wakeup.notify_one();
    }

    /// Blocks until the earliest armed deadline expires and returns its
    /// message. Returns `None` once closed.
    pub fn next_due(&self) -> Option<MessageId> {
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.closed {
                return None;
            }
            let now = Instant::now();
            match state.deadlines.peek().copied() {
                Some(Reverse((deadline, id))) if deadline <= now => {
                    state.deadlines.pop();
                    if state.armed.remove(&id) {
                        return Some(id);
                    }
                }
                Some(Reverse((deadline, _))) => {
                    state = self
                        .wakeup
                        .wait_timeout(state, deadline - now)
                        .expect("lock poisoned")
                        .0;
                }
                None => {
                    state = self.wakeup.wait(state).expect("lock poisoned");
                }
            }
        }
    }

    /// Counts one more attempt towards `host` and returns the count before
    /// this call.
    pub fn bump(&self, id: MessageId, host: HostId) -> u32 {
        let mut state = self.state.lock().expect("lock poisoned");
        let attempts = state.attempts.entry((id, host)).or_insert(0);
        let previous = *attempts;
        *attempts = attempts.saturating_add(1);
        previous
    }

    pub fn attempts(&self, id: MessageId, host: HostId) -> u32 {
        let state = self.state.lock().expect("lock poisoned");
        state.attempts.get(&(id, host)).copied().unwrap_or(0)
    }

    /// Cancels every pending tick and counter of `id`.
    pub fn forget(&self, id: MessageId) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.armed.remove(&id);
        state.attempts.retain(|(message, _), _| *message != id);
    }

    pub fn is_armed(&self, id: MessageId) -> bool {
        self.state.lock().expect("lock poisoned").armed.contains(&id)
    }

    pub fn close(&self) {
        self.state.lock().expect("lock poisoned").closed = true;
        self.wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn deadlines_fire_in_order() {
        let scheduler = RetryScheduler::new();
        let late = MessageId::generate();
        let early = MessageId::generate();

        scheduler.schedule(late, Duration::from_millis(30));
        scheduler.schedule(early, Duration::from_millis(5));

        assert_eq!(scheduler.next_due(), Some(early));
        assert_eq!(scheduler.next_due(), Some(late));
    }

    #[test]
    fn forgotten_message_is_skipped() {
        let scheduler = RetryScheduler::new();
        let cancelled = MessageId::generate();
        let kept = MessageId::generate();

        scheduler.schedule(cancelled, Duration::ZERO);
        scheduler.schedule(kept, Duration::from_millis(5));
        scheduler.forget(cancelled);

        assert_eq!(scheduler.next_due(), Some(kept));
        assert!(!scheduler.is_armed(cancelled));
    }

    #[test]
    fn bump_reports_previous_attempts() {
        let scheduler = RetryScheduler::new();
        let id = MessageId::generate();
        let host = HostId::generate();

        assert_eq!(scheduler.bump(id, host), 0);
        assert_eq!(scheduler.bump(id, host), 1);
        assert_eq!(scheduler.attempts(id, host), 2);

        scheduler.forget(id);
        assert_eq!(scheduler.attempts(id, host), 0);
    }

    #[test]
    fn close_unblocks_waiter() {
        let scheduler = Arc::new(RetryScheduler::new());
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.next_due())
        };
        scheduler.close();

        assert_eq!(waiter.join().expect("waiter panicked"), None);
    }
}
