//! Duplicate suppression for completed messages.
//!
//! Once a message is stable its acknowledgment record is gone, so a late
//! retransmission or a late ACK would otherwise look brand new (and a late
//! ACK would lazily create a record that never completes). The window below
//! remembers the most recently completed IDs.
//!
//! # Eviction
//!
//! Bounded FIFO: when full, the oldest ID is forgotten. The window only has
//! to outlive the retry budget of a message, not the whole session.

use std::collections::{HashSet, VecDeque};

use vsync_types::MessageId;

/// Recently completed message IDs.
///
/// Not thread-safe; the reliability layer keeps it behind its own lock.
#[derive(Debug, Clone)]
pub struct RecentMessages {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl RecentMessages {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Remembers `id`. Returns false if it was already known.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_insert_reports_duplicate() {
        let mut recent = RecentMessages::new(4);
        let id = MessageId::generate();

        assert!(recent.insert(id));
        assert!(!recent.insert(id));
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn oldest_entry_is_evicted_first() {
        let mut recent = RecentMessages::new(2);
        let ids: Vec<MessageId> = (0..3).map(|_| MessageId::generate()).collect();
        for id in &ids {
            recent.insert(*id);
        }

        assert!(!recent.contains(&ids[0]));
        assert!(recent.contains(&ids[1]));
        assert!(recent.contains(&ids[2]));
        assert_eq!(recent.len(), 2);
    }
}
