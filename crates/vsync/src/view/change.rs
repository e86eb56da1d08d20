//! View-change list: who still has to confirm a membership change.
//!
//! Confirmations can arrive before the list of expected hosts is known (a
//! newcomer may be contacted by members before its initial topology
//! arrives), so the list tracks both sides and matches them up.

use std::collections::BTreeSet;

use vsync_types::HostId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewChangeList {
    /// Hosts whose confirmation is still required.
    expected: BTreeSet<HostId>,
    /// Hosts that confirmed.
    confirmed: BTreeSet<HostId>,
    /// Hosts that confirmed before they were expected.
    unexpected: BTreeSet<HostId>,
}

impl ViewChangeList {
    /// A list waiting for every host in `expected`.
    pub fn from_expected_users(expected: impl IntoIterator<Item = HostId>) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            ..Self::default()
        }
    }

    /// A list opened by a confirmation that arrived first.
    pub fn from_unexpected_user(host: HostId) -> Self {
        let mut list = Self::default();
        list.confirm(host);
        list
    }

    /// Declares the hosts to wait for, matching earlier confirmations.
    pub fn set_expected_users(&mut self, expected: impl IntoIterator<Item = HostId>) {
        for host in expected {
            if self.unexpected.remove(&host) {
                self.confirmed.insert(host);
            } else if !self.confirmed.contains(&host) {
                self.expected.insert(host);
            }
        }
    }

    /// Records a confirmation from `host`.
    pub fn confirm(&mut self, host: HostId) {
        if self.expected.remove(&host) {
            self.confirmed.insert(host);
        } else if !self.confirmed.contains(&host) {
            self.unexpected.insert(host);
        }
    }

    /// Stops waiting for `host` (it failed mid-change).
    pub fn remove_expected(&mut self, host: HostId) {
        self.expected.remove(&host);
        self.unexpected.remove(&host);
        self.confirmed.remove(&host);
    }

    /// Hosts whose confirmation is still required.
    pub fn pending(&self) -> impl Iterator<Item = &HostId> {
        self.expected.iter()
    }

    /// True once every expected host confirmed and no stranger did.
    pub fn is_complete(&self) -> bool {
        self.expected.is_empty() && self.unexpected.is_empty()
    }
}
