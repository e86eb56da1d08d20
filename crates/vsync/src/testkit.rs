//! Single-host fixtures for unit tests: a transport that records what it is
//! asked to send, and a reliability layer wired to it inside a fixed view.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tempfile::TempDir;
use vsync_transport::{Inbound, LinkEvent, Transport, TransportError};
use vsync_types::{HostId, Presence, ProcessId, ScalarClock, Ticket};

use crate::clock::LamportClock;
use crate::config::GroupConfig;
use crate::message::{MessageKind, Payload, ReliabilityMessage, ViewMessage};
use crate::recovery::{FaultRecovery, Identity};
use crate::reliability::ReliabilityLayer;
use crate::view::{Member, SharedView, View, ViewInput, ViewManager, ViewStatus};

// ============================================================================
// Recording Transport
// ============================================================================

/// Accepts every send and keeps the decoded message. Nothing ever arrives.
#[derive(Debug)]
pub(crate) struct RecordingTransport {
    local: Presence,
    sent: Mutex<Vec<(HostId, ReliabilityMessage)>>,
    disconnected: Mutex<Vec<HostId>>,
}

impl RecordingTransport {
    pub(crate) fn new(local: Presence) -> Self {
        Self {
            local,
            sent: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<(HostId, ReliabilityMessage)> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn sent_to(&self, host: HostId) -> Vec<ReliabilityMessage> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| *to == host)
            .map(|(_, message)| message)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().expect("lock poisoned").clear();
    }

    pub(crate) fn disconnected(&self) -> Vec<HostId> {
        self.disconnected.lock().expect("lock poisoned").clone()
    }
}

impl Transport for RecordingTransport {
    fn local(&self) -> Presence {
        self.local
    }

    fn send(&self, to: HostId, payload: Bytes) -> Result<(), TransportError> {
        let message = ReliabilityMessage::decode(&payload).expect("sent bytes decode");
        self.sent.lock().expect("lock poisoned").push((to, message));
        Ok(())
    }

    fn receive(&self) -> Result<Inbound, TransportError> {
        Err(TransportError::Closed)
    }

    fn next_event(&self) -> Result<LinkEvent, TransportError> {
        Err(TransportError::Closed)
    }

    fn connected(&self) -> Vec<HostId> {
        Vec::new()
    }

    fn peer_addr(&self, _host: HostId) -> Option<SocketAddr> {
        None
    }

    fn disconnect(&self, host: HostId) {
        self.disconnected.lock().expect("lock poisoned").push(host);
    }

    fn open_connection(&self, _addr: SocketAddr, _host: HostId) -> Result<(), TransportError> {
        Ok(())
    }

    fn start_discovery(&self) {}

    fn stop_discovery(&self) {}

    fn close(&self) {}
}

// ============================================================================
// Harness
// ============================================================================

/// One host, process 1, active in a view with `members`.
pub(crate) struct Harness {
    pub(crate) local: HostId,
    pub(crate) identity: Identity,
    pub(crate) config: GroupConfig,
    pub(crate) transport: Arc<RecordingTransport>,
    pub(crate) clock: Arc<LamportClock>,
    pub(crate) view: Arc<SharedView>,
    pub(crate) recovery: Arc<FaultRecovery>,
    pub(crate) layer: Arc<ReliabilityLayer>,
    inbox: Option<Receiver<ViewInput>>,
    _dir: TempDir,
}

impl Harness {
    /// `manager` defaults to the local host.
    pub(crate) fn new(members: &[HostId], manager: Option<HostId>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = GroupConfig::testing(dir.path());
        let process_id = ProcessId::new(1);
        let mut identity = Identity::generate().with_ticket(Ticket::new(10));
        identity.process_id = Some(process_id);
        let local = identity.host;

        let mut view = View::new(local, Some(process_id), ViewStatus::Active);
        for (i, host) in members.iter().enumerate() {
            view.insert(Member::new(*host, ProcessId::new(i as u32 + 2), None));
        }
        view.set_manager(Some(manager.unwrap_or(local)));
        let view = Arc::new(SharedView::new(view));

        let transport = Arc::new(RecordingTransport::new(identity.presence()));
        let clock = Arc::new(LamportClock::new(process_id));
        let recovery = Arc::new(FaultRecovery::open(&config));
        let (inbox_tx, inbox) = mpsc::channel();
        let layer = Arc::new(ReliabilityLayer::new(
            config.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&clock),
            Arc::clone(&view),
            Arc::clone(&recovery),
            inbox_tx,
        ));

        Self {
            local,
            identity,
            config,
            transport,
            clock,
            view,
            recovery,
            layer,
            inbox: Some(inbox),
            _dir: dir,
        }
    }

    /// What the layer reported to the view manager.
    pub(crate) fn inbox(&self) -> &Receiver<ViewInput> {
        self.inbox.as_ref().expect("inbox moved into a view manager")
    }

    /// A view manager over this host's components. Takes the inbox.
    pub(crate) fn view_manager(&mut self) -> ViewManager {
        ViewManager::new(
            self.identity.clone(),
            self.config.clone(),
            Arc::clone(&self.transport) as Arc<dyn Transport>,
            Arc::clone(&self.layer),
            Arc::clone(&self.recovery),
            Arc::clone(&self.clock),
            Arc::clone(&self.view),
            self.inbox.take().expect("inbox moved into a view manager"),
        )
    }

    /// Feeds `message` to the layer as if `from` had sent it.
    pub(crate) fn deliver(&self, from: HostId, message: &ReliabilityMessage) {
        self.layer.handle_inbound(inbound(from, message));
    }
}

pub(crate) fn inbound(from: HostId, message: &ReliabilityMessage) -> Inbound {
    Inbound {
        from,
        payload: message.encode().expect("encode"),
    }
}

pub(crate) fn stamp(process: u32, event: u64) -> ScalarClock {
    ScalarClock::new(ProcessId::new(process), event)
}

pub(crate) fn app_data(
    origin: HostId,
    destinations: Vec<HostId>,
    body: &'static [u8],
    event: u64,
) -> ReliabilityMessage {
    ReliabilityMessage::data(
        origin,
        destinations,
        Payload::Application(Bytes::from_static(body)),
        stamp(7, event),
    )
}

pub(crate) fn view_data(
    origin: HostId,
    destinations: Vec<HostId>,
    message: ViewMessage,
    event: u64,
) -> ReliabilityMessage {
    ReliabilityMessage::data(origin, destinations, Payload::View(message), stamp(0, event))
}

pub(crate) fn ack_of(acker: HostId, message: &ReliabilityMessage) -> ReliabilityMessage {
    ReliabilityMessage::ack(acker, message, stamp(9, message.timestamp.event_id() + 1))
}

pub(crate) fn acks(messages: &[ReliabilityMessage]) -> usize {
    messages.iter().filter(|m| m.kind == MessageKind::Ack).count()
}
