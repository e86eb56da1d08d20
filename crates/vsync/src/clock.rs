//! The single owner of this host's Lamport counter.

use std::sync::Mutex;

use vsync_types::{ProcessId, ScalarClock};

#[derive(Debug)]
struct ClockState {
    process_id: ProcessId,
    local: u64,
}

/// Thread-safe Lamport clock.
///
/// Every timestamp this host emits is minted here, and every received
/// timestamp is merged here, so the counter is never touched anywhere else.
#[derive(Debug)]
pub struct LamportClock {
    state: Mutex<ClockState>,
}

impl LamportClock {
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            state: Mutex::new(ClockState {
                process_id,
                local: 0,
            }),
        }
    }

    /// Mints the next timestamp for a locally produced message.
    pub fn tick(&self) -> ScalarClock {
        let mut state = self.state.lock().expect("lock poisoned");
        let stamp = ScalarClock::next(state.process_id, state.local);
        state.local = stamp.event_id();
        stamp
    }

    /// Advances the counter past a received timestamp.
    pub fn observe(&self, received: &ScalarClock) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.local = ScalarClock::merge(received, state.local);
    }

    /// Changes the tie-breaker used for future timestamps (on admission).
    pub fn set_process_id(&self, process_id: ProcessId) {
        self.state.lock().expect("lock poisoned").process_id = process_id;
    }

    pub fn process_id(&self) -> ProcessId {
        self.state.lock().expect("lock poisoned").process_id
    }

    /// The last event ID minted or observed.
    pub fn current(&self) -> u64 {
        self.state.lock().expect("lock poisoned").local
    }
}
