//! # View Manager
//!
//! Maintains the agreed membership and changes it safely.
//!
//! ## Roles
//!
//! One host is the *view manager*; it coordinates every change. A
//! *substitute* is nominated at each admission and takes over if the manager
//! fails. When two unconnected hosts meet, the one with the lower ticket
//! dials the other, and the dialed host founds the group as manager.
//!
//! ## Admission (manager side)
//!
//! ```text
//! FreezeView ──► members          (they stop application sends)
//! wait_stabilization
//! InitialTopology ──► newcomer    (process ID, topology, substitute, counter)
//! NewHost ──► members             (members connect: ConnectRequest / Confirm)
//! wait for Confirm from every member and the newcomer
//! [checkpoint ──► Checkpoint { id } ──► members]
//! RestartView ──► members         (sending resumes)
//! ```
//!
//! ## Failure
//!
//! A failed host is removed, the manager role passes to the substitute (or
//! the smallest process ID) if needed, and the manager announces
//! `DisconnectedClient` and runs a checkpoint cycle.
//!
//! Every input is handled on one thread, in arrival order; admissions and
//! checkpoint cycles never overlap.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};
use vsync_transport::{LinkEvent, Transport, TransportError};
use vsync_types::{CheckpointId, HostId, Presence, ProcessId};

use crate::clock::LamportClock;
use crate::config::GroupConfig;
use crate::message::ViewMessage;
use crate::recovery::{Checkpoint, FaultRecovery, Identity};
use crate::reliability::ReliabilityLayer;
use crate::VsyncError;

mod change;
mod state;

pub use change::ViewChangeList;
pub use state::{Member, SharedView, View, ViewStatus};

/// Everything the view manager reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewInput {
    /// A transport link changed.
    Link(LinkEvent),
    /// A view message arrived through the reliability layer.
    Message { from: HostId, message: ViewMessage },
    /// The reliability layer gave up on a host.
    PeerFailed(HostId),
    /// The recovery log reached its threshold.
    CheckpointDue,
    Shutdown,
}

/// Admission in progress at the manager.
#[derive(Debug)]
struct Admission {
    newcomer: Member,
    confirmations: ViewChangeList,
}

/// Work postponed until the running admission completes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Deferred {
    Admit(Presence),
    Checkpoint,
}

/// Join in progress at a newcomer.
#[derive(Debug, Default)]
struct Join {
    /// Topology received from the manager; `None` until it arrives.
    topology: Option<Vec<Member>>,
    confirmations: Option<ViewChangeList>,
}

// ============================================================================
// View Manager
// ============================================================================

/// The membership protocol of one host. Runs on its own thread.
#[derive(Debug)]
pub struct ViewManager {
    identity: Identity,
    config: GroupConfig,
    transport: Arc<dyn Transport>,
    reliability: Arc<ReliabilityLayer>,
    recovery: Arc<FaultRecovery>,
    clock: Arc<LamportClock>,
    view: Arc<SharedView>,
    inbox: Receiver<ViewInput>,

    /// Listen addresses heard in discovery beacons.
    known_addrs: HashMap<HostId, SocketAddr>,
    /// Higher-ticket host we dialed to found or join a group.
    dialed: Option<HostId>,
    join: Option<Join>,
    admission: Option<Admission>,
    deferred: VecDeque<Deferred>,
    /// Newcomer this member was told to connect to.
    pending_newcomer: Option<Member>,
    /// Restarted host that has not received its recovery packet yet.
    recovering: bool,
}

impl ViewManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Identity,
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        reliability: Arc<ReliabilityLayer>,
        recovery: Arc<FaultRecovery>,
        clock: Arc<LamportClock>,
        view: Arc<SharedView>,
        inbox: Receiver<ViewInput>,
    ) -> Self {
        let recovering = identity.is_restored();
        Self {
            identity,
            config,
            transport,
            reliability,
            recovery,
            clock,
            view,
            inbox,
            known_addrs: HashMap::new(),
            dialed: None,
            join: None,
            admission: None,
            deferred: VecDeque::new(),
            pending_newcomer: None,
            recovering,
        }
    }

    fn local(&self) -> HostId {
        self.identity.host
    }

    /// Starts discovery and processes inputs until shutdown.
    pub fn run(mut self) {
        info!(
            host = %self.local(),
            ticket = %self.identity.ticket,
            recovering = self.recovering,
            "view manager started"
        );
        self.transport.start_discovery();

        while let Ok(input) = self.inbox.recv() {
            if !self.handle(input) {
                break;
            }
        }
        debug!(host = %self.local(), "view manager stopped");
    }

    /// Handles one input. Returns false on shutdown.
    fn handle(&mut self, input: ViewInput) -> bool {
        match input {
            ViewInput::Link(LinkEvent::Discovered { presence, addr }) => {
                self.on_discovered(presence, addr)
            }
            ViewInput::Link(LinkEvent::Accepted { presence }) => {
                debug!(peer = %presence.host, "link accepted");
            }
            ViewInput::Link(LinkEvent::Lost(host)) => {
                debug!(peer = %host, "link lost");
                self.handle_failure(host);
            }
            ViewInput::PeerFailed(host) => self.handle_failure(host),
            ViewInput::Message { from, message } => self.on_message(from, message),
            ViewInput::CheckpointDue => self.on_checkpoint_due(),
            ViewInput::Shutdown => return false,
        }
        true
    }

    // ------------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------------

    fn in_group(&self) -> bool {
        self.view.manager().is_some()
    }

    fn is_manager(&self) -> bool {
        self.view.is_manager()
    }

    fn idle_status(&self) -> ViewStatus {
        if self.recovering {
            ViewStatus::Recovering
        } else {
            ViewStatus::Unconnected
        }
    }

    fn set_status(&self, status: ViewStatus) {
        let mut view = self.view.write();
        if view.status() != status {
            debug!(host = %self.local(), from = %view.status(), to = %status, "status changed");
            view.set_status(status);
        }
    }

    fn send(&self, destinations: &[HostId], message: ViewMessage) {
        self.reliability.send_view_message(destinations, message);
    }

    fn addr_of(&self, host: HostId) -> Option<SocketAddr> {
        self.transport
            .peer_addr(host)
            .or_else(|| self.known_addrs.get(&host).copied())
    }

    /// Takes a process ID and persists the identity that goes with it.
    fn assume_process_id(&mut self, process_id: ProcessId) {
        self.view.write().set_process_id(process_id);
        self.clock.set_process_id(process_id);
        self.identity.process_id = Some(process_id);
        self.recovery.persist_identity(&self.identity);
    }

    fn protocol_violation(&self, from: HostId, message: &'static str) {
        error!(
            host = %self.local(),
            from = %from,
            message,
            status = %self.view.status(),
            "protocol violation: unexpected view message dropped"
        );
    }

    // ------------------------------------------------------------------------
    // Discovery and election
    // ------------------------------------------------------------------------

    fn on_discovered(&mut self, presence: Presence, addr: SocketAddr) {
        let host = presence.host;
        if host == self.local() {
            return;
        }
        self.known_addrs.insert(host, addr);

        if self.in_group() {
            if self.is_manager() {
                self.admit(presence);
            }
            return;
        }
        if self.dialed.is_some() || self.join.is_some() {
            return;
        }

        let ours = (self.identity.ticket, self.local());
        if (presence.ticket, host) < ours {
            trace!(peer = %host, "lower ticket discovered; waiting for it to dial");
            return;
        }

        self.reliability.readmit(host);
        match self.transport.open_connection(addr, host) {
            Ok(()) => {
                info!(peer = %host, ticket = %presence.ticket, "dialing higher-ticket host");
                self.dialed = Some(host);
                self.set_status(ViewStatus::Joining);
                self.send(
                    &[host],
                    ViewMessage::Advertise {
                        presence: self.identity.presence(),
                    },
                );
            }
            Err(e) => debug!(peer = %host, error = %e, "dial failed"),
        }
    }

    fn on_advertise(&mut self, from: HostId, presence: Presence) {
        if self.in_group() {
            if self.is_manager() {
                self.admit(presence);
            } else {
                debug!(peer = %from, "advertise reached a member; dropping link");
                self.transport.disconnect(from);
            }
            return;
        }

        if self.dialed.is_some() || self.join.is_some() {
            debug!(peer = %from, "already joining elsewhere; dropping link");
            self.transport.disconnect(from);
            return;
        }

        self.found_group();
        self.admit(presence);
    }

    /// Becomes the manager of a new, single-host view.
    fn found_group(&mut self) {
        let process_id = self.identity.process_id.unwrap_or(ProcessId::ZERO);
        self.assume_process_id(process_id);
        {
            let mut view = self.view.write();
            view.set_manager(Some(self.local()));
            view.set_status(ViewStatus::Active);
        }
        self.recovering = false;
        self.transport.stop_discovery();
        info!(host = %self.local(), process = %process_id, "founded group as view manager");
    }

    // ------------------------------------------------------------------------
    // Admission: manager side
    // ------------------------------------------------------------------------

    fn admit(&mut self, presence: Presence) {
        let host = presence.host;
        if self.view.contains(host)
            || self.admission.as_ref().is_some_and(|a| a.newcomer.host == host)
        {
            trace!(peer = %host, "already admitted or being admitted");
            return;
        }
        if self.admission.is_some() {
            if !self.deferred.contains(&Deferred::Admit(presence)) {
                debug!(peer = %host, "admission deferred");
                self.deferred.push_back(Deferred::Admit(presence));
            }
            return;
        }
        let Some(addr) = self.addr_of(host) else {
            warn!(peer = %host, "no address known; admission skipped");
            return;
        };

        info!(peer = %host, "admitting host");
        self.reliability.readmit(host);

        let members = self.view.member_ids();
        if !self.freeze(&members) {
            return;
        }

        if !self.transport.connected().contains(&host) {
            if let Err(e) = self.transport.open_connection(addr, host) {
                warn!(peer = %host, error = %e, "cannot reach newcomer; admission aborted");
                self.restart(&members);
                return;
            }
        }

        let (process_id, substitute, topology) = {
            let mut view = self.view.write();
            let process_id = presence
                .process_id
                .filter(|pid| !view.is_process_id_taken(*pid))
                .unwrap_or_else(|| view.next_process_id());
            let substitute = view
                .substitute()
                .or_else(|| members.first().copied())
                .or(Some(host));
            view.set_substitute(substitute);
            (process_id, substitute, view.topology())
        };
        let newcomer = Member::new(host, process_id, Some(addr));

        self.send(
            &[host],
            ViewMessage::InitialTopology {
                manager: self.local(),
                process_id,
                topology,
                substitute,
                checkpoint_counter: self.recovery.counter(),
            },
        );
        self.send(
            &members,
            ViewMessage::NewHost {
                newcomer: newcomer.clone(),
                substitute,
            },
        );

        let expected = members.iter().copied().chain(std::iter::once(host));
        self.admission = Some(Admission {
            newcomer,
            confirmations: ViewChangeList::from_expected_users(expected),
        });
    }

    fn on_admission_confirm(&mut self, from: HostId) {
        let Some(admission) = self.admission.as_mut() else {
            debug!(peer = %from, "confirm without admission ignored");
            return;
        };
        admission.confirmations.confirm(from);
        trace!(
            peer = %from,
            waiting = admission.confirmations.pending().count(),
            "admission confirmation"
        );
        self.try_complete_admission();
    }

    fn try_complete_admission(&mut self) {
        let complete = self
            .admission
            .as_ref()
            .is_some_and(|a| a.confirmations.is_complete());
        if !complete {
            return;
        }
        let Some(admission) = self.admission.take() else {
            return;
        };

        let host = admission.newcomer.host;
        self.view.write().insert(admission.newcomer);
        let members = self.view.member_ids();
        info!(peer = %host, members = members.len(), "host admitted");

        if self.config.checkpoint_on_admission {
            if let Some(id) = self.recovery.do_checkpoint() {
                self.send(&members, ViewMessage::Checkpoint { id });
            }
        }
        self.restart(&members);
    }

    fn abort_admission(&mut self) {
        let Some(admission) = self.admission.take() else {
            return;
        };
        let host = admission.newcomer.host;
        warn!(peer = %host, "newcomer failed; admission aborted");

        let members = self.view.member_ids();
        let (manager, substitute) = {
            let mut view = self.view.write();
            if view.substitute() == Some(host) {
                let fallback = members.first().copied();
                view.set_substitute(fallback);
            }
            (self.local(), view.substitute())
        };
        self.send(
            &members,
            ViewMessage::DisconnectedClient {
                host,
                manager,
                substitute,
            },
        );
        self.restart(&members);
    }

    // ------------------------------------------------------------------------
    // Freeze cycles
    // ------------------------------------------------------------------------

    /// Freezes the group and waits until nothing is in flight. Returns false
    /// if the layer shut down meanwhile.
    fn freeze(&mut self, members: &[HostId]) -> bool {
        self.set_status(ViewStatus::Frozen);
        if !members.is_empty() {
            self.send(members, ViewMessage::FreezeView);
        }
        self.reliability.stop_message_sending();
        self.reliability.wait_stabilization()
    }

    /// Ends a freeze: members resume, then deferred work runs.
    fn restart(&mut self, members: &[HostId]) {
        if !members.is_empty() {
            self.send(members, ViewMessage::RestartView);
        }
        self.set_status(ViewStatus::Active);
        self.reliability.start_message_sending();

        while self.admission.is_none() {
            match self.deferred.pop_front() {
                Some(Deferred::Admit(presence)) => self.admit(presence),
                Some(Deferred::Checkpoint) => self.checkpoint_cycle(),
                None => break,
            }
        }
    }

    fn on_checkpoint_due(&mut self) {
        if !self.is_manager() {
            trace!("log threshold reached at a member; waiting for the manager");
            return;
        }
        if self.recovery.log_len() < self.config.log_threshold {
            return;
        }
        self.checkpoint_cycle();
    }

    /// Freeze, checkpoint, broadcast the ID, restart.
    fn checkpoint_cycle(&mut self) {
        if self.admission.is_some() {
            if !self.deferred.contains(&Deferred::Checkpoint) {
                self.deferred.push_back(Deferred::Checkpoint);
            }
            return;
        }

        let members = self.view.member_ids();
        if !self.freeze(&members) {
            return;
        }
        if let Some(id) = self.recovery.do_checkpoint() {
            self.send(&members, ViewMessage::Checkpoint { id });
        }
        self.restart(&members);
    }

    // ------------------------------------------------------------------------
    // Admission: member and newcomer side
    // ------------------------------------------------------------------------

    fn on_new_host(&mut self, from: HostId, newcomer: Member, substitute: Option<HostId>) {
        if !self.in_group() || Some(from) != self.view.manager() {
            self.protocol_violation(from, "NewHost");
            return;
        }

        let host = newcomer.host;
        self.view.write().set_substitute(substitute);
        self.reliability.readmit(host);

        let connected = match newcomer.addr {
            Some(addr) => self.transport.open_connection(addr, host),
            None => Err(TransportError::NotConnected(host)),
        };
        self.pending_newcomer = Some(newcomer);

        match connected {
            Ok(()) => {
                let process_id = self.view.process_id().unwrap_or_default();
                self.send(&[host], ViewMessage::ConnectRequest { process_id });
            }
            Err(e) => {
                warn!(peer = %host, error = %e, "cannot connect to newcomer");
                self.handle_failure(host);
            }
        }
    }

    fn on_connect_request(&mut self, from: HostId) {
        if self.in_group() && self.join.is_none() {
            self.protocol_violation(from, "ConnectRequest");
            return;
        }

        self.reliability.readmit(from);
        self.send(&[from], ViewMessage::Confirm);

        let join = self.join.get_or_insert_with(Join::default);
        match join.confirmations.as_mut() {
            Some(list) => list.confirm(from),
            None => join.confirmations = Some(ViewChangeList::from_unexpected_user(from)),
        }
        self.try_complete_join();
    }

    fn on_initial_topology(
        &mut self,
        from: HostId,
        manager: HostId,
        process_id: ProcessId,
        topology: Vec<Member>,
        substitute: Option<HostId>,
        checkpoint_counter: CheckpointId,
    ) {
        if self.in_group() {
            self.protocol_violation(from, "InitialTopology");
            return;
        }

        if let Some(dialed) = self.dialed.take() {
            if dialed != manager {
                debug!(peer = %dialed, "joining another group; dropping dialed link");
                self.transport.disconnect(dialed);
            }
        }

        self.assume_process_id(process_id);
        self.recovery.advance_counter(checkpoint_counter);
        {
            let mut view = self.view.write();
            view.set_manager(Some(manager));
            view.set_substitute(substitute);
            view.set_status(ViewStatus::Joining);
        }
        info!(
            host = %self.local(),
            manager = %manager,
            process = %process_id,
            peers = topology.len(),
            "initial topology received"
        );

        for member in &topology {
            self.reliability.readmit(member.host);
        }
        let local = self.local();
        let expected: Vec<HostId> = topology
            .iter()
            .map(|m| m.host)
            .filter(|h| *h != manager && *h != local)
            .collect();

        let join = self.join.get_or_insert_with(Join::default);
        match join.confirmations.as_mut() {
            Some(list) => list.set_expected_users(expected),
            None => join.confirmations = Some(ViewChangeList::from_expected_users(expected)),
        }
        join.topology = Some(topology);
        self.try_complete_join();
    }

    /// Installs the view once every announced peer has connected.
    fn try_complete_join(&mut self) {
        let ready = self.join.as_ref().is_some_and(|j| {
            j.topology.is_some() && j.confirmations.as_ref().map_or(true, |c| c.is_complete())
        });
        if !ready {
            return;
        }
        let Some(topology) = self.join.take().and_then(|j| j.topology) else {
            return;
        };

        let members: Vec<Member> = topology
            .into_iter()
            .map(|m| {
                let addr = m.addr.or_else(|| self.addr_of(m.host));
                Member::new(m.host, m.process_id, addr)
            })
            .collect();
        {
            let mut view = self.view.write();
            for member in members {
                view.insert(member);
            }
        }

        if let Some(manager) = self.view.manager() {
            debug!(host = %self.local(), "view installed; confirming to manager");
            self.send(&[manager], ViewMessage::Confirm);
        }
    }

    fn on_confirm(&mut self, from: HostId) {
        if self.is_manager() {
            self.on_admission_confirm(from);
            return;
        }

        match self.pending_newcomer.take() {
            Some(newcomer) if newcomer.host == from => {
                debug!(peer = %from, "newcomer confirmed");
                self.view.write().insert(newcomer);
                if let Some(manager) = self.view.manager() {
                    self.send(&[manager], ViewMessage::Confirm);
                }
            }
            other => {
                self.pending_newcomer = other;
                debug!(peer = %from, "unexpected confirm ignored");
            }
        }
    }

    fn on_restart_view(&mut self, from: HostId) {
        if Some(from) != self.view.manager() {
            self.protocol_violation(from, "RestartView");
            return;
        }

        let newly_joined = self.view.status() == ViewStatus::Joining;
        if newly_joined {
            self.transport.stop_discovery();
            info!(host = %self.local(), members = self.view.member_ids().len(), "joined group");
        }

        self.reliability.start_message_sending();
        if self.recovering {
            self.set_status(ViewStatus::Recovering);
            if newly_joined {
                let after = self.recovery.last_checkpoint();
                info!(after = ?after, "requesting recovery");
                self.send(&[from], ViewMessage::RecoveryRequest { after });
            }
        } else {
            self.set_status(ViewStatus::Active);
        }
    }

    fn on_freeze(&mut self, from: HostId) {
        if Some(from) != self.view.manager() {
            self.protocol_violation(from, "FreezeView");
            return;
        }
        // The reliability layer stopped sending on arrival, but a restart
        // queued ahead of this freeze may have reopened the gate since.
        if self.reliability.is_sending_enabled() {
            debug!(host = %self.local(), "gate reopened by an earlier restart; closing");
            self.reliability.stop_message_sending();
        }
        self.set_status(ViewStatus::Frozen);
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    /// Turns the local log into the manager's checkpoint `id`.
    ///
    /// The group is frozen, but messages this host received may still wait
    /// for acks travelling on other links; they are drained first so every
    /// host's checkpoint `id` holds the same entries.
    fn on_checkpoint(&mut self, from: HostId, id: CheckpointId) {
        if Some(from) != self.view.manager() {
            self.protocol_violation(from, "Checkpoint");
            return;
        }
        if !self.reliability.wait_stabilization() {
            return;
        }
        self.recovery.adopt_checkpoint(id);
    }

    fn on_recovery_request(&mut self, from: HostId, after: Option<CheckpointId>) {
        if !self.is_manager() {
            self.protocol_violation(from, "RecoveryRequest");
            return;
        }

        let start = after.map_or(CheckpointId::ZERO, |id| id.next());
        let checkpoints = match self.recovery.recover_checkpoint(start) {
            Ok(checkpoints) => checkpoints,
            Err(VsyncError::CheckpointNotFound(_)) => Vec::new(),
            Err(e) => {
                error!(peer = %from, error = %e, "recovery request failed");
                Vec::new()
            }
        };
        info!(peer = %from, from = %start, checkpoints = checkpoints.len(), "sending recovery packet");
        self.send(&[from], ViewMessage::RecoveryPacket { checkpoints });
    }

    fn on_recovery_packet(&mut self, from: HostId, checkpoints: Vec<Checkpoint>) {
        if !self.recovering {
            self.protocol_violation(from, "RecoveryPacket");
            return;
        }

        let deliveries = self.recovery.add_missing_checkpoints(checkpoints);
        info!(recovered = deliveries.len(), "recovery complete");
        self.reliability.deliver_recovered(deliveries);
        self.recovering = false;
        if self.view.status() == ViewStatus::Recovering {
            self.set_status(ViewStatus::Active);
        }
    }

    // ------------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------------

    fn on_disconnected_client(
        &mut self,
        from: HostId,
        host: HostId,
        manager: HostId,
        substitute: Option<HostId>,
    ) {
        if host == self.local() {
            warn!(reported_by = %from, "removed from the view by the group");
            return;
        }

        if self.is_manager() {
            debug!(peer = %host, reported_by = %from, "failure reported");
            self.handle_failure(host);
            return;
        }

        // A successor announces itself when the failed host was our manager.
        let current = self.view.manager();
        let authoritative = Some(from) == current || (from == manager && Some(host) == current);
        if !authoritative {
            self.protocol_violation(from, "DisconnectedClient");
            return;
        }

        self.reliability.handle_disconnection(host);
        self.transport.disconnect(host);
        if self.pending_newcomer.as_ref().is_some_and(|m| m.host == host) {
            self.pending_newcomer = None;
        }
        {
            let mut view = self.view.write();
            view.remove(host);
            view.set_manager(Some(manager));
            view.set_substitute(substitute);
        }
        info!(peer = %host, manager = %manager, "host removed from view");

        self.forget_join_peer(host);
    }

    /// Stops a join in progress from waiting for `host`.
    fn forget_join_peer(&mut self, host: HostId) {
        let Some(join) = self.join.as_mut() else {
            return;
        };
        if let Some(list) = join.confirmations.as_mut() {
            list.remove_expected(host);
        }
        if let Some(topology) = join.topology.as_mut() {
            topology.retain(|m| m.host != host);
        }
        self.try_complete_join();
    }

    /// Reacts to a host that is gone, whatever detected it.
    fn handle_failure(&mut self, host: HostId) {
        if host == self.local() {
            return;
        }
        self.reliability.handle_disconnection(host);

        if self.dialed == Some(host) && !self.in_group() {
            info!(peer = %host, "dialed host lost; back to discovery");
            self.dialed = None;
            self.join = None;
            self.set_status(self.idle_status());
            self.transport.start_discovery();
            return;
        }

        if self.join.is_some() && self.view.status() == ViewStatus::Joining {
            if Some(host) == self.view.manager() {
                self.abandon_join();
            } else {
                self.forget_join_peer(host);
            }
            return;
        }

        if self.admission.as_ref().is_some_and(|a| a.newcomer.host == host) {
            self.transport.disconnect(host);
            self.abort_admission();
            return;
        }
        if let Some(admission) = self.admission.as_mut() {
            admission.confirmations.remove_expected(host);
        }

        if self.pending_newcomer.as_ref().is_some_and(|m| m.host == host) {
            self.pending_newcomer = None;
            self.report_failure(host);
            return;
        }

        if !self.view.contains(host) {
            trace!(peer = %host, "failure of a non-member ignored");
            return;
        }
        self.transport.disconnect(host);
        self.remove_member(host);

        if self.is_manager() {
            let mut recipients = self.view.member_ids();
            if let Some(admission) = &self.admission {
                recipients.push(admission.newcomer.host);
            }
            let substitute = self.view.snapshot().substitute();
            self.send(
                &recipients,
                ViewMessage::DisconnectedClient {
                    host,
                    manager: self.local(),
                    substitute,
                },
            );
            if self.admission.is_some() {
                if !self.deferred.contains(&Deferred::Checkpoint) {
                    self.deferred.push_back(Deferred::Checkpoint);
                }
                self.try_complete_admission();
            } else {
                self.checkpoint_cycle();
            }
        } else {
            self.report_failure(host);
        }
    }

    /// Removes a member, handing the manager role over if it held it.
    fn remove_member(&mut self, host: HostId) {
        let local = self.local();
        let mut view = self.view.write();
        let was_manager = view.manager() == Some(host);
        let successor = if was_manager {
            view.successor(host)
        } else {
            view.manager()
        };

        view.remove(host);
        view.set_manager(successor);
        if successor == Some(local) && view.substitute().map_or(true, |s| s == local) {
            let substitute = view.member_ids().first().copied();
            view.set_substitute(substitute);
        }
        drop(view);

        info!(peer = %host, was_manager, manager = ?successor, "host removed from view");
        if was_manager && successor == Some(local) {
            info!(host = %local, "taking over as view manager");
        }
    }

    fn report_failure(&self, host: HostId) {
        let Some(manager) = self.view.manager() else {
            return;
        };
        let substitute = self.view.snapshot().substitute();
        self.send(
            &[manager],
            ViewMessage::DisconnectedClient {
                host,
                manager,
                substitute,
            },
        );
    }

    fn abandon_join(&mut self) {
        warn!(host = %self.local(), "manager lost while joining; back to discovery");
        self.join = None;
        self.dialed = None;
        let status = self.idle_status();
        {
            let mut view = self.view.write();
            view.reset();
            view.set_status(status);
        }
        self.transport.start_discovery();
    }

    // ------------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------------

    fn on_message(&mut self, from: HostId, message: ViewMessage) {
        trace!(from = %from, message = message.name(), "view message");
        match message {
            ViewMessage::Advertise { presence } => self.on_advertise(from, presence),
            ViewMessage::FreezeView => self.on_freeze(from),
            ViewMessage::InitialTopology {
                manager,
                process_id,
                topology,
                substitute,
                checkpoint_counter,
            } => self.on_initial_topology(
                from,
                manager,
                process_id,
                topology,
                substitute,
                checkpoint_counter,
            ),
            ViewMessage::NewHost {
                newcomer,
                substitute,
            } => self.on_new_host(from, newcomer, substitute),
            ViewMessage::ConnectRequest { .. } => self.on_connect_request(from),
            ViewMessage::Confirm => self.on_confirm(from),
            ViewMessage::RestartView => self.on_restart_view(from),
            ViewMessage::DisconnectedClient {
                host,
                manager,
                substitute,
            } => self.on_disconnected_client(from, host, manager, substitute),
            ViewMessage::RecoveryRequest { after } => self.on_recovery_request(from, after),
            ViewMessage::RecoveryPacket { checkpoints } => {
                self.on_recovery_packet(from, checkpoints)
            }
            ViewMessage::Checkpoint { id } => self.on_checkpoint(from, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::message::Delivery;
    use crate::testkit::{ack_of, app_data, inbound, view_data, Harness};

    #[test]
    fn checkpoint_waits_for_in_flight_messages() {
        let (manager, other) = (HostId::generate(), HostId::generate());
        let mut h = Harness::new(&[manager, other], Some(manager));

        // Received from the manager; the other member's ack is still on its way.
        let message = app_data(manager, vec![h.local, other], b"in flight", 1);
        h.deliver(manager, &message);
        assert_eq!(h.recovery.log_len(), 0);

        let mut vm = h.view_manager();
        let late_ack = {
            let layer = Arc::clone(&h.layer);
            let ack = inbound(other, &ack_of(other, &message));
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                layer.handle_inbound(ack);
            })
        };

        assert!(vm.handle(ViewInput::Message {
            from: manager,
            message: ViewMessage::Checkpoint {
                id: CheckpointId::ZERO,
            },
        }));
        late_ack.join().expect("ack thread panicked");

        let checkpoints = h
            .recovery
            .recover_checkpoint(CheckpointId::ZERO)
            .expect("checkpoint adopted");
        let expected = Delivery::from_message(&message).expect("application message");
        assert_eq!(checkpoints[0].entries, vec![expected]);
        assert_eq!(h.recovery.log_len(), 0);
        assert_eq!(h.recovery.counter(), CheckpointId::ZERO.next());
    }

    #[test]
    fn checkpoint_from_a_member_is_dropped() {
        let (manager, other) = (HostId::generate(), HostId::generate());
        let mut h = Harness::new(&[manager, other], Some(manager));
        h.deliver(manager, &app_data(manager, vec![h.local], b"logged", 1));
        assert_eq!(h.recovery.log_len(), 1);

        let mut vm = h.view_manager();
        vm.handle(ViewInput::Message {
            from: other,
            message: ViewMessage::Checkpoint {
                id: CheckpointId::ZERO,
            },
        });

        assert_eq!(h.recovery.log_len(), 1);
        assert!(h.recovery.last_checkpoint().is_none());
    }

    #[test]
    fn restart_queued_before_freeze_does_not_reopen_sending() {
        let (manager, other) = (HostId::generate(), HostId::generate());
        let mut h = Harness::new(&[manager, other], Some(manager));

        // The inbound thread handles both before the view manager runs.
        let members = vec![h.local, other];
        h.deliver(manager, &view_data(manager, members.clone(), ViewMessage::RestartView, 1));
        h.deliver(manager, &view_data(manager, members, ViewMessage::FreezeView, 2));
        assert!(!h.layer.is_sending_enabled());

        let mut vm = h.view_manager();
        while let Ok(input) = vm.inbox.try_recv() {
            assert!(vm.handle(input));
        }

        assert!(!h.layer.is_sending_enabled());
        assert_eq!(h.view.status(), ViewStatus::Frozen);
    }
}
