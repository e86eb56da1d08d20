//! The membership view and its shared handle.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use vsync_types::{HostId, ProcessId};

/// A host as the view records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub host: HostId,
    pub process_id: ProcessId,
    /// Where the host accepts connections, when known.
    pub addr: Option<SocketAddr>,
}

impl Member {
    pub fn new(host: HostId, process_id: ProcessId, addr: Option<SocketAddr>) -> Self {
        Self {
            host,
            process_id,
            addr,
        }
    }
}

/// Where a host stands in the membership protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewStatus {
    /// Not part of any group; discovering.
    Unconnected,
    /// Contacted a group and waiting to be admitted.
    Joining,
    /// Member of a view with traffic flowing.
    Active,
    /// Member of a view that is being changed; application sends paused.
    Frozen,
    /// Restarted with a persisted identity; catching up through recovery.
    Recovering,
}

impl Display for ViewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewStatus::Unconnected => "unconnected",
            ViewStatus::Joining => "joining",
            ViewStatus::Active => "active",
            ViewStatus::Frozen => "frozen",
            ViewStatus::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

// ============================================================================
// View
// ============================================================================

/// This host's picture of the group.
///
/// `members` never contains the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    local: HostId,
    process_id: Option<ProcessId>,
    members: BTreeMap<HostId, Member>,
    manager: Option<HostId>,
    substitute: Option<HostId>,
    status: ViewStatus,
}

impl View {
    pub fn new(local: HostId, process_id: Option<ProcessId>, status: ViewStatus) -> Self {
        Self {
            local,
            process_id,
            members: BTreeMap::new(),
            manager: None,
            substitute: None,
            status,
        }
    }

    pub fn local(&self) -> HostId {
        self.local
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process_id
    }

    pub fn manager(&self) -> Option<HostId> {
        self.manager
    }

    pub fn substitute(&self) -> Option<HostId> {
        self.substitute
    }

    pub fn status(&self) -> ViewStatus {
        self.status
    }

    pub fn is_manager(&self) -> bool {
        self.manager == Some(self.local)
    }

    pub fn contains(&self, host: HostId) -> bool {
        self.members.contains_key(&host)
    }

    pub fn member(&self, host: HostId) -> Option<&Member> {
        self.members.get(&host)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_ids(&self) -> Vec<HostId> {
        self.members.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `process_id` is held by this host or a member.
    pub fn is_process_id_taken(&self, process_id: ProcessId) -> bool {
        self.process_id == Some(process_id)
            || self.members.values().any(|m| m.process_id == process_id)
    }

    /// The process ID following the highest one in use.
    pub fn next_process_id(&self) -> ProcessId {
        self.members
            .values()
            .map(|m| m.process_id)
            .chain(self.process_id)
            .max()
            .map_or(ProcessId::ZERO, |highest| highest.next())
    }

    /// Who takes over if `failed` was the manager: the substitute if it is
    /// still around, else the remaining host with the smallest process ID.
    pub fn successor(&self, failed: HostId) -> Option<HostId> {
        if let Some(substitute) = self.substitute {
            if substitute != failed && (substitute == self.local || self.contains(substitute)) {
                return Some(substitute);
            }
        }

        let local = self.process_id.map(|pid| (pid, self.local));
        self.members
            .values()
            .filter(|m| m.host != failed)
            .map(|m| (m.process_id, m.host))
            .chain(local)
            .min()
            .map(|(_, host)| host)
    }

    /// The members plus this host, as sent in an initial topology.
    pub fn topology(&self) -> Vec<Member> {
        let mut topology: Vec<Member> = self.members.values().cloned().collect();
        if let Some(process_id) = self.process_id {
            topology.push(Member::new(self.local, process_id, None));
        }
        topology
    }

    pub(crate) fn set_process_id(&mut self, process_id: ProcessId) {
        self.process_id = Some(process_id);
    }

    pub(crate) fn set_manager(&mut self, manager: Option<HostId>) {
        self.manager = manager;
    }

    pub(crate) fn set_substitute(&mut self, substitute: Option<HostId>) {
        self.substitute = substitute;
    }

    pub(crate) fn set_status(&mut self, status: ViewStatus) {
        self.status = status;
    }

    pub(crate) fn insert(&mut self, member: Member) {
        if member.host != self.local {
            self.members.insert(member.host, member);
        }
    }

    pub(crate) fn remove(&mut self, host: HostId) -> Option<Member> {
        let removed = self.members.remove(&host);
        if self.substitute == Some(host) {
            self.substitute = None;
        }
        removed
    }

    /// Forgets the group entirely (back to discovery).
    pub(crate) fn reset(&mut self) {
        self.members.clear();
        self.manager = None;
        self.substitute = None;
        self.status = ViewStatus::Unconnected;
    }
}

// ============================================================================
// Shared View
// ============================================================================

/// The view, readable from any thread and written only by the view manager.
#[derive(Debug)]
pub struct SharedView {
    inner: RwLock<View>,
}

impl SharedView {
    pub fn new(view: View) -> Self {
        Self {
            inner: RwLock::new(view),
        }
    }

    /// A consistent copy of the whole view.
    pub fn snapshot(&self) -> View {
        self.read().clone()
    }

    pub fn member_ids(&self) -> Vec<HostId> {
        self.read().member_ids()
    }

    pub fn contains(&self, host: HostId) -> bool {
        self.read().contains(host)
    }

    pub fn manager(&self) -> Option<HostId> {
        self.read().manager()
    }

    pub fn status(&self) -> ViewStatus {
        self.read().status()
    }

    pub fn is_manager(&self) -> bool {
        self.read().is_manager()
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.read().process_id()
    }

    fn read(&self) -> RwLockReadGuard<'_, View> {
        self.inner.read().expect("lock poisoned")
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, View> {
        self.inner.write().expect("lock poisoned")
    }
}
