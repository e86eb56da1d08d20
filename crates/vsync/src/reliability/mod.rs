//! # Reliability Layer
//!
//! Turns the best-effort transport into an acknowledged, stability-tracked
//! broadcast with a total delivery order.
//!
//! ## Message lifecycle
//!
//! ```text
//! outbound:  CREATED ──► SENT ──► STABLE
//!                          │
//!                          ├──► RETRYING ──► STABLE
//!                          └──► PEER_DISCONNECTED (recipient struck, others continue)
//!
//! inbound:   DATA/SINGLE ──► tracked + ACKed ──► queued unstable ──► STABLE ──► delivered
//! ```
//!
//! A message is stable at a host once the host holds it and every other
//! recipient has acknowledged it there. Recipients acknowledge `Data` to the
//! origin and to every other recipient, and `Single` by unicast.
//!
//! ## Threads
//!
//! - inbound: consumes [`Transport::receive`]
//! - send loop: drains the application send queue while sending is enabled
//! - retry: serves the [`RetryScheduler`] deadline heap
//!
//! ## Freeze
//!
//! The send loop dispatches while holding the send gate, so
//! [`ReliabilityLayer::stop_message_sending`] returns only after any
//! in-flight dispatch has finished. View messages are never gated.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use vsync_transport::{Inbound, Transport, TransportError};
use vsync_types::{HostId, MessageId};

use crate::clock::LamportClock;
use crate::config::GroupConfig;
use crate::message::{Delivery, MessageKind, Payload, ReliabilityMessage, ViewMessage};
use crate::recovery::FaultRecovery;
use crate::view::{SharedView, ViewInput};
use crate::{VsyncError, VsyncResult};

mod ack;
mod dedup;
mod queue;
mod retry;

pub use ack::{AckTracker, HostPurge};
pub use dedup::RecentMessages;
pub use queue::StableQueue;
pub use retry::RetryScheduler;

/// Retransmissions to a silent recipient before it is declared disconnected.
pub const MAX_RETRIES: u32 = 2;

#[derive(Debug, Default)]
struct SendGate {
    open: bool,
    closed: bool,
}

// ============================================================================
// Reliability Layer
// ============================================================================

/// Reliable broadcast for one host.
#[derive(Debug)]
pub struct ReliabilityLayer {
    local: HostId,
    config: GroupConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<LamportClock>,
    view: Arc<SharedView>,
    recovery: Arc<FaultRecovery>,
    inbox: Sender<ViewInput>,

    tracker: AckTracker,
    queue: Arc<StableQueue<Delivery>>,
    retry: RetryScheduler,

    /// Messages held until stable, keyed by ID.
    pending: Mutex<HashMap<MessageId, ReliabilityMessage>>,
    recent: Mutex<RecentMessages>,

    /// Hosts declared failed and not yet readmitted.
    suspects: Mutex<HashSet<HostId>>,

    gate: Mutex<SendGate>,
    gate_changed: Condvar,
    /// Held from clock tick to transport send, so every link carries
    /// messages and acks in timestamp order.
    wire: Mutex<()>,
    outbox: Mutex<Option<SyncSender<Bytes>>>,
    outbox_rx: Mutex<Option<Receiver<Bytes>>>,
}

impl ReliabilityLayer {
    /// Creates the layer with sending disabled.
    pub fn new(
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<LamportClock>,
        view: Arc<SharedView>,
        recovery: Arc<FaultRecovery>,
        inbox: Sender<ViewInput>,
    ) -> Self {
        let (outbox, outbox_rx) = mpsc::sync_channel(config.send_queue_capacity);
        Self {
            local: transport.local().host,
            recent: Mutex::new(RecentMessages::new(config.recent_messages)),
            config,
            transport,
            clock,
            view,
            recovery,
            inbox,
            tracker: AckTracker::new(),
            queue: Arc::new(StableQueue::new()),
            retry: RetryScheduler::new(),
            pending: Mutex::new(HashMap::new()),
            suspects: Mutex::new(HashSet::new()),
            gate: Mutex::new(SendGate::default()),
            gate_changed: Condvar::new(),
            wire: Mutex::new(()),
            outbox: Mutex::new(Some(outbox)),
            outbox_rx: Mutex::new(Some(outbox_rx)),
        }
    }

    /// The queue application messages are delivered from.
    pub fn delivery_queue(&self) -> Arc<StableQueue<Delivery>> {
        Arc::clone(&self.queue)
    }

    pub fn tracker(&self) -> &AckTracker {
        &self.tracker
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Queues an application payload for group-wide delivery.
    ///
    /// Blocks while the send queue is full.
    pub fn submit(&self, payload: Bytes) -> VsyncResult<()> {
        let outbox = self
            .outbox
            .lock()
            .expect("lock poisoned")
            .clone()
            .ok_or(VsyncError::ShutDown)?;
        outbox.send(payload).map_err(|_| VsyncError::ShutDown)
    }

    /// Sends a control message to `destinations`, bypassing the send gate.
    ///
    /// One destination makes it a `Single` message.
    pub fn send_view_message(&self, destinations: &[HostId], message: ViewMessage) -> Option<MessageId> {
        if destinations.is_empty() {
            trace!(message = message.name(), "view message without destinations dropped");
            return None;
        }
        let kind = if destinations.len() == 1 {
            MessageKind::Single
        } else {
            MessageKind::Data
        };
        debug!(
            message = message.name(),
            destinations = destinations.len(),
            "sending view message"
        );
        self.dispatch(kind, destinations.to_vec(), Payload::View(message))
    }

    /// Drains the application send queue. Runs until [`ReliabilityLayer::close`].
    pub fn run_send_loop(&self) {
        let Some(outbox) = self.outbox_rx.lock().expect("lock poisoned").take() else {
            error!("send loop started twice");
            return;
        };

        while let Ok(payload) = outbox.recv() {
            let gate = self.gate.lock().expect("lock poisoned");
            let gate = self
                .gate_changed
                .wait_while(gate, |g| !g.open && !g.closed)
                .expect("lock poisoned");
            if gate.closed {
                break;
            }
            let destinations = self.live_members();
            self.dispatch(MessageKind::Data, destinations, Payload::Application(payload));
            drop(gate);
        }
        debug!(host = %self.local, "send loop stopped");
    }

    /// Enables application sends (end of a freeze).
    pub fn start_message_sending(&self) {
        let mut gate = self.gate.lock().expect("lock poisoned");
        if !gate.open {
            debug!(host = %self.local, "message sending enabled");
        }
        gate.open = true;
        self.gate_changed.notify_all();
    }

    /// Disables application sends. Returns once no dispatch is in flight.
    pub fn stop_message_sending(&self) {
        let mut gate = self.gate.lock().expect("lock poisoned");
        if gate.open {
            debug!(host = %self.local, "message sending disabled");
        }
        gate.open = false;
    }

    pub fn is_sending_enabled(&self) -> bool {
        self.gate.lock().expect("lock poisoned").open
    }

    /// Blocks until every tracked message is stable. Returns false if the
    /// layer was closed while waiting.
    pub fn wait_stabilization(&self) -> bool {
        self.tracker.wait_until_empty()
    }

    fn live_members(&self) -> Vec<HostId> {
        let suspects = self.suspects.lock().expect("lock poisoned");
        self.view
            .member_ids()
            .into_iter()
            .filter(|host| !suspects.contains(host))
            .collect()
    }

    fn dispatch(
        &self,
        kind: MessageKind,
        destinations: Vec<HostId>,
        payload: Payload,
    ) -> Option<MessageId> {
        let _wire = self.wire.lock().expect("lock poisoned");
        let timestamp = self.clock.tick();
        let message = match kind {
            MessageKind::Single => {
                ReliabilityMessage::single(self.local, destinations[0], payload, timestamp)
            }
            _ => ReliabilityMessage::data(self.local, destinations, payload, timestamp),
        };
        let id = message.id;

        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(message = %id, error = %e, "failed to encode message");
                return None;
            }
        };

        let destinations = message.destinations.clone();
        let loopback = Delivery::from_message(&message);
        self.pending
            .lock()
            .expect("lock poisoned")
            .insert(id, message);
        self.tracker.track_outgoing(id, self.local, &destinations);
        if let Some(delivery) = loopback {
            self.queue.add(delivery);
        }

        if destinations.is_empty() {
            self.check_complete(id);
            return Some(id);
        }

        self.retry.schedule(id, self.config.retry_interval);
        trace!(message = %id, destinations = destinations.len(), "message sent");
        for host in destinations {
            self.send_to(host, bytes.clone());
        }
        Some(id)
    }

    fn send_to(&self, host: HostId, bytes: Bytes) {
        match self.transport.send(host, bytes) {
            Ok(()) => {}
            Err(TransportError::Closed) => {}
            Err(e) => {
                warn!(peer = %host, error = %e, "send failed");
                self.declare_disconnected(host);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Processes inbound traffic until the transport closes.
    pub fn run_inbound(&self) {
        loop {
            match self.transport.receive() {
                Ok(inbound) => self.handle_inbound(inbound),
                Err(TransportError::Closed) => break,
                Err(e) => warn!(error = %e, "receive failed"),
            }
        }
        debug!(host = %self.local, "inbound loop stopped");
    }

    pub(crate) fn handle_inbound(&self, inbound: Inbound) {
        let message = match ReliabilityMessage::decode(&inbound.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(peer = %inbound.from, error = %e, "protocol violation: undecodable message dropped");
                return;
            }
        };
        self.clock.observe(&message.timestamp);

        if message.is_ack() {
            self.handle_ack(message);
        } else {
            self.handle_original(message);
        }
    }

    fn handle_ack(&self, ack: ReliabilityMessage) {
        let id = ack.reference_id;
        {
            let recent = self.recent.lock().expect("lock poisoned");
            if recent.contains(&id) {
                trace!(message = %id, acker = %ack.sender, "late ack ignored");
                return;
            }
            let recipients = self.required_acks(&ack);
            self.tracker
                .receive_ack(id, ack.origin, ack.sender, &recipients);
        }
        self.check_complete(id);
    }

    fn handle_original(&self, message: ReliabilityMessage) {
        let id = message.id;
        let recipients = self.required_acks(&message);
        {
            let recent = self.recent.lock().expect("lock poisoned");
            let mut pending = self.pending.lock().expect("lock poisoned");
            if recent.contains(&id) || pending.contains_key(&id) {
                drop(pending);
                drop(recent);
                trace!(message = %id, from = %message.sender, "duplicate re-acknowledged");
                self.acknowledge(&message, &[]);
                return;
            }
            pending.insert(id, message.clone());
            self.tracker.track_incoming(id, message.origin, &recipients);
        }

        match &message.payload {
            Some(Payload::View(view_message)) => {
                match view_message {
                    ViewMessage::FreezeView => self.stop_message_sending(),
                    ViewMessage::DisconnectedClient { host, .. } if *host != self.local => {
                        self.handle_disconnection(*host)
                    }
                    _ => {}
                }
                self.acknowledge(&message, &recipients);
                let input = ViewInput::Message {
                    from: message.origin,
                    message: view_message.clone(),
                };
                if self.inbox.send(input).is_err() {
                    debug!("view manager gone; view message dropped");
                }
            }
            Some(Payload::Application(_)) => {
                self.acknowledge(&message, &recipients);
                if let Some(delivery) = Delivery::from_message(&message) {
                    self.queue.add(delivery);
                }
            }
            None => {}
        }

        self.check_complete(id);
    }

    /// Hosts that must acknowledge `message` here, failed hosts excluded.
    fn required_acks(&self, message: &ReliabilityMessage) -> Vec<HostId> {
        let suspects = self.suspects.lock().expect("lock poisoned");
        message
            .required_acks(self.local)
            .into_iter()
            .filter(|host| !suspects.contains(host))
            .collect()
    }

    /// Sends an ACK for `message` to its sender and to `others`.
    fn acknowledge(&self, message: &ReliabilityMessage, others: &[HostId]) {
        let _wire = self.wire.lock().expect("lock poisoned");
        let ack = ReliabilityMessage::ack(self.local, message, self.clock.tick());
        let bytes = match ack.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(message = %message.id, error = %e, "failed to encode ack");
                return;
            }
        };

        self.send_to(message.sender, bytes.clone());
        if message.kind == MessageKind::Single {
            return;
        }
        for host in others.iter().filter(|h| **h != message.sender) {
            self.send_to(*host, bytes.clone());
        }
    }

    // ------------------------------------------------------------------------
    // Stability
    // ------------------------------------------------------------------------

    fn check_complete(&self, id: MessageId) {
        if !self.tracker.is_complete(id) {
            return;
        }
        let Some(message) = self.pending.lock().expect("lock poisoned").remove(&id) else {
            return;
        };

        self.retry.forget(id);
        if let Some(delivery) = Delivery::from_message(&message) {
            self.queue.mark_stable(&delivery);
            self.recovery.log_message(delivery);
        }

        let mut recent = self.recent.lock().expect("lock poisoned");
        recent.insert(id);
        self.tracker.remove(id);
        trace!(message = %id, payload = message.payload.as_ref().map(Payload::name), "message stable");
    }

    // ------------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------------

    /// Serves retry deadlines until [`ReliabilityLayer::close`].
    pub fn run_retry_loop(&self) {
        while let Some(id) = self.retry.next_due() {
            self.retry_tick(id);
        }
        debug!(host = %self.local, "retry loop stopped");
    }

    fn retry_tick(&self, id: MessageId) {
        let Some(message) = self.pending.lock().expect("lock poisoned").get(&id).cloned() else {
            self.retry.forget(id);
            return;
        };
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(message = %id, error = %e, "failed to encode retransmission");
                return;
            }
        };

        let mut exhausted = Vec::new();
        for host in self.tracker.missing(id) {
            let attempts = self.retry.bump(id, host);
            if attempts >= self.config.max_retries {
                exhausted.push(host);
            } else {
                debug!(message = %id, peer = %host, attempt = attempts + 1, "retransmitting");
                self.send_to(host, bytes.clone());
            }
        }
        for host in exhausted {
            self.declare_disconnected(host);
        }

        // Stability may have raced the bumps above; drop any counter they
        // recreated after the message was forgotten.
        if self.pending.lock().expect("lock poisoned").contains_key(&id) {
            self.retry.schedule(id, self.config.retry_interval);
        } else {
            self.retry.forget(id);
        }
    }

    // ------------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------------

    /// Gives up on `host`: closes its link, purges what waits on it and
    /// tells the view manager.
    pub fn declare_disconnected(&self, host: HostId) {
        if host == self.local {
            return;
        }
        if self.suspects.lock().expect("lock poisoned").contains(&host) {
            return;
        }
        warn!(peer = %host, "peer declared disconnected");
        self.transport.disconnect(host);
        self.handle_disconnection(host);
        if self.inbox.send(ViewInput::PeerFailed(host)).is_err() {
            debug!("view manager gone; failure not reported");
        }
    }

    /// Stops waiting for `host`.
    ///
    /// Messages it originated that are not stable are dropped; it is struck
    /// from the recipients of every other message, which may complete them.
    pub fn handle_disconnection(&self, host: HostId) {
        if !self.suspects.lock().expect("lock poisoned").insert(host) {
            return;
        }

        let purge = self.tracker.forget_host(host);
        if !purge.dropped.is_empty() || !purge.completed.is_empty() {
            info!(
                peer = %host,
                dropped = purge.dropped.len(),
                completed = purge.completed.len(),
                "purged messages of failed peer"
            );
        }

        for id in purge.dropped {
            self.retry.forget(id);
            let message = self.pending.lock().expect("lock poisoned").remove(&id);
            if let Some(delivery) = message.as_ref().and_then(Delivery::from_message) {
                self.queue.remove(&delivery);
            }
        }
        for id in purge.completed {
            self.check_complete(id);
        }
    }

    /// Accepts traffic from `host` again (it is being admitted).
    pub fn readmit(&self, host: HostId) {
        if self.suspects.lock().expect("lock poisoned").remove(&host) {
            debug!(peer = %host, "peer readmitted");
        }
    }

    pub fn is_suspect(&self, host: HostId) -> bool {
        self.suspects.lock().expect("lock poisoned").contains(&host)
    }

    /// Places recovered deliveries on the queue, ready for the application.
    pub fn deliver_recovered(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.queue.add_stable(delivery);
        }
    }

    /// Stops every loop and releases every blocked caller.
    pub fn close(&self) {
        self.outbox.lock().expect("lock poisoned").take();
        {
            let mut gate = self.gate.lock().expect("lock poisoned");
            gate.closed = true;
            self.gate_changed.notify_all();
        }
        self.retry.close();
        self.tracker.close();
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testkit::{ack_of, acks, app_data, stamp, view_data, Harness};

    const NO_WAIT: Duration = Duration::from_millis(20);

    fn send_app(h: &Harness, destinations: Vec<HostId>, body: &'static [u8]) -> MessageId {
        h.layer
            .dispatch(
                MessageKind::Data,
                destinations,
                Payload::Application(Bytes::from_static(body)),
            )
            .expect("dispatched")
    }

    fn original(h: &Harness, to: HostId, id: MessageId) -> ReliabilityMessage {
        h.transport
            .sent_to(to)
            .into_iter()
            .find(|m| m.id == id)
            .expect("original sent")
    }

    #[test]
    fn silent_recipient_is_retried_then_disconnected() {
        let (a, b) = (HostId::generate(), HostId::generate());
        let h = Harness::new(&[a, b], None);

        let id = send_app(&h, vec![a, b], b"m");
        h.deliver(a, &ack_of(a, &original(&h, a, id)));

        for _ in 0..=MAX_RETRIES {
            h.layer.retry_tick(id);
        }

        assert_eq!(h.transport.sent_to(b).len(), 1 + MAX_RETRIES as usize);
        assert_eq!(h.transport.sent_to(a).len(), 1);
        assert_eq!(h.transport.disconnected(), vec![b]);
        assert_eq!(h.inbox().try_recv(), Ok(ViewInput::PeerFailed(b)));
        assert!(h.layer.is_suspect(b));

        // Striking b completed the message.
        assert!(h.layer.tracker().is_empty());
        let delivered = h.layer.delivery_queue().retrieve_stable_timeout(NO_WAIT);
        assert_eq!(delivered.map(|d| d.payload), Some(Bytes::from_static(b"m")));
        assert_eq!(h.recovery.log_len(), 1);

        h.layer.retry_tick(id);
        assert_eq!(h.transport.sent_to(b).len(), 1 + MAX_RETRIES as usize);
        assert_eq!(h.layer.retry.attempts(id, b), 0);
        assert!(!h.layer.retry.is_armed(id));
    }

    #[test]
    fn stable_message_is_not_retransmitted() {
        let (a, b) = (HostId::generate(), HostId::generate());
        let h = Harness::new(&[a, b], None);

        let id = send_app(&h, vec![a, b], b"m");
        let sent = original(&h, a, id);
        h.deliver(a, &ack_of(a, &sent));
        h.deliver(b, &ack_of(b, &sent));
        assert!(!h.layer.retry.is_armed(id));

        h.transport.clear();
        h.layer.retry_tick(id);

        assert!(h.transport.sent().is_empty());
        assert!(h.transport.disconnected().is_empty());
        assert_eq!(h.layer.retry.attempts(id, a), 0);
    }

    #[test]
    fn retry_counters_of_a_stable_message_are_dropped() {
        let a = HostId::generate();
        let h = Harness::new(&[a], None);

        let id = send_app(&h, vec![a], b"m");
        // A tick that read the missing set just before the ack landed.
        assert_eq!(h.layer.tracker().missing(id), vec![a]);
        h.deliver(a, &ack_of(a, &original(&h, a, id)));
        h.layer.retry.bump(id, a);

        h.layer.retry_tick(id);

        assert_eq!(h.layer.retry.attempts(id, a), 0);
        assert!(!h.layer.retry.is_armed(id));
    }

    #[test]
    fn single_is_acknowledged_to_its_sender_only() {
        let (a, b) = (HostId::generate(), HostId::generate());
        let h = Harness::new(&[a, b], Some(a));

        let single = ReliabilityMessage::single(
            a,
            h.local,
            Payload::View(ViewMessage::RecoveryRequest { after: None }),
            stamp(2, 1),
        );
        h.deliver(a, &single);

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        let (to, ack) = &sent[0];
        assert_eq!(*to, a);
        assert!(ack.is_ack());
        assert_eq!(ack.reference_id, single.id);
        assert!(h.layer.tracker().is_empty());
        assert!(matches!(
            h.inbox().try_recv(),
            Ok(ViewInput::Message { from, message: ViewMessage::RecoveryRequest { .. } }) if from == a
        ));

        // Data is acknowledged to every other recipient as well.
        h.transport.clear();
        h.deliver(a, &app_data(a, vec![h.local, b], b"d", 2));
        assert_eq!(acks(&h.transport.sent_to(a)), 1);
        assert_eq!(acks(&h.transport.sent_to(b)), 1);
    }

    #[test]
    fn duplicate_data_is_reacknowledged_but_delivered_once() {
        let (a, b) = (HostId::generate(), HostId::generate());
        let h = Harness::new(&[a, b], Some(a));
        let queue = h.layer.delivery_queue();

        let message = app_data(a, vec![h.local, b], b"once", 1);
        h.deliver(a, &message);
        h.deliver(a, &message);

        assert_eq!(acks(&h.transport.sent_to(a)), 2);
        assert_eq!(acks(&h.transport.sent_to(b)), 1);
        assert_eq!(queue.len(), 1);

        h.deliver(b, &ack_of(b, &message));
        h.deliver(a, &message);

        assert_eq!(acks(&h.transport.sent_to(a)), 3);
        let first = queue.retrieve_stable_timeout(NO_WAIT);
        assert_eq!(first.map(|d| d.payload), Some(Bytes::from_static(b"once")));
        assert_eq!(queue.retrieve_stable_timeout(NO_WAIT), None);
        assert_eq!(h.recovery.log_len(), 1);
    }

    #[test]
    fn late_ack_for_stable_message_is_ignored() {
        let a = HostId::generate();
        let h = Harness::new(&[a], None);

        let id = send_app(&h, vec![a], b"m");
        let ack = ack_of(a, &original(&h, a, id));
        h.deliver(a, &ack);
        assert!(h.layer.tracker().is_empty());

        h.deliver(a, &ack);

        assert!(!h.layer.tracker().contains(id));
        assert!(h.layer.tracker().wait_until_empty_timeout(NO_WAIT));
    }

    #[test]
    fn disconnection_purges_unstable_messages_of_failed_origin() {
        let (a, b) = (HostId::generate(), HostId::generate());
        let h = Harness::new(&[a, b], None);
        let queue = h.layer.delivery_queue();

        let from_a = app_data(a, vec![h.local, b], b"from a", 1);
        h.deliver(a, &from_a);
        let dropped = Delivery::from_message(&from_a).expect("application message");
        assert!(queue.contains(&dropped));

        let id = send_app(&h, vec![a, b], b"ours");
        h.deliver(b, &ack_of(b, &original(&h, b, id)));

        h.layer.handle_disconnection(a);

        assert!(!queue.contains(&dropped));
        assert!(h.layer.is_suspect(a));
        assert!(h.layer.tracker().is_empty());
        let delivered = queue.retrieve_stable_timeout(NO_WAIT);
        assert_eq!(delivered.map(|d| d.payload), Some(Bytes::from_static(b"ours")));
        // A link loss is not a reliability verdict.
        assert!(h.transport.disconnected().is_empty());
        assert!(h.inbox().try_recv().is_err());
    }

    #[test]
    fn freeze_closes_the_send_gate_on_arrival() {
        let (m, a) = (HostId::generate(), HostId::generate());
        let h = Harness::new(&[m, a], Some(m));
        h.layer.start_message_sending();

        h.deliver(m, &view_data(m, vec![h.local, a], ViewMessage::FreezeView, 1));

        assert!(!h.layer.is_sending_enabled());
        assert_eq!(
            h.inbox().try_recv(),
            Ok(ViewInput::Message { from: m, message: ViewMessage::FreezeView })
        );
    }
}
