//! The group facade: wires the layers to a transport and runs their threads.
//!
//! Construction is two-phase. Every shared component and the view manager's
//! inbox are created first, each component receives the handles it needs,
//! and only then are the threads started:
//!
//! | Thread | Loop |
//! |--------|------|
//! | `vsync-inbound` | [`ReliabilityLayer::run_inbound`] |
//! | `vsync-send` | [`ReliabilityLayer::run_send_loop`] |
//! | `vsync-retry` | [`ReliabilityLayer::run_retry_loop`] |
//! | `vsync-view` | [`ViewManager::run`] |
//! | `vsync-links` | link events → view manager inbox |
//! | `vsync-checkpoint` | [`FaultRecovery::run_watcher`] |

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use vsync_transport::{LinkEvent, Transport, TransportError};
use vsync_types::{HostId, ProcessId};

use crate::clock::LamportClock;
use crate::config::GroupConfig;
use crate::message::Delivery;
use crate::recovery::{FaultRecovery, Identity};
use crate::reliability::{ReliabilityLayer, StableQueue};
use crate::view::{SharedView, View, ViewInput, ViewManager, ViewStatus};
use crate::{VsyncError, VsyncResult};

/// A running group member.
///
/// Dropping it shuts it down.
pub struct Group {
    local: HostId,
    transport: Arc<dyn Transport>,
    reliability: Arc<ReliabilityLayer>,
    recovery: Arc<FaultRecovery>,
    view: Arc<SharedView>,
    queue: Arc<StableQueue<Delivery>>,
    inbox: Sender<ViewInput>,
    threads: Vec<JoinHandle<()>>,
    shut_down: AtomicBool,
}

impl Group {
    /// Starts a member on `transport`.
    ///
    /// The transport must announce `identity`. The member begins unconnected
    /// (or recovering, for a restored identity) and joins a group through
    /// discovery.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn start(
        config: GroupConfig,
        identity: Identity,
        transport: Arc<dyn Transport>,
    ) -> VsyncResult<Self> {
        let local = identity.host;
        debug_assert_eq!(transport.local().host, local, "transport announces another host");
        info!(host = %local, restored = identity.is_restored(), "starting group member");

        let status = if identity.is_restored() {
            ViewStatus::Recovering
        } else {
            ViewStatus::Unconnected
        };

        // Phase one: every component and channel.
        let (inbox, inbox_rx) = mpsc::channel();
        let clock = Arc::new(LamportClock::new(identity.process_id.unwrap_or_default()));
        let view = Arc::new(SharedView::new(View::new(local, None, status)));
        let recovery = Arc::new(FaultRecovery::open(&config));
        let reliability = Arc::new(ReliabilityLayer::new(
            config.clone(),
            Arc::clone(&transport),
            Arc::clone(&clock),
            Arc::clone(&view),
            Arc::clone(&recovery),
            inbox.clone(),
        ));
        let view_manager = ViewManager::new(
            identity,
            config,
            Arc::clone(&transport),
            Arc::clone(&reliability),
            Arc::clone(&recovery),
            clock,
            Arc::clone(&view),
            inbox_rx,
        );

        let mut group = Self {
            local,
            queue: reliability.delivery_queue(),
            transport,
            reliability,
            recovery,
            view,
            inbox,
            threads: Vec::new(),
            shut_down: AtomicBool::new(false),
        };

        // Phase two: threads.
        let reliability = Arc::clone(&group.reliability);
        group.spawn("vsync-inbound", move || reliability.run_inbound())?;

        let reliability = Arc::clone(&group.reliability);
        group.spawn("vsync-send", move || reliability.run_send_loop())?;

        let reliability = Arc::clone(&group.reliability);
        group.spawn("vsync-retry", move || reliability.run_retry_loop())?;

        group.spawn("vsync-view", move || view_manager.run())?;

        let transport = Arc::clone(&group.transport);
        let reliability = Arc::clone(&group.reliability);
        let inbox = group.inbox.clone();
        group.spawn("vsync-links", move || {
            pump_link_events(transport.as_ref(), &reliability, &inbox)
        })?;

        let recovery = Arc::clone(&group.recovery);
        let inbox = group.inbox.clone();
        group.spawn("vsync-checkpoint", move || {
            recovery.run_watcher(|| inbox.send(ViewInput::CheckpointDue).is_ok())
        })?;

        Ok(group)
    }

    fn spawn(&mut self, name: &str, f: impl FnOnce() + Send + 'static) -> VsyncResult<()> {
        let handle = thread::Builder::new()
            .name(format!("{name}-{}", self.local))
            .spawn(f)
            .map_err(|e| VsyncError::Storage(io::Error::other(e)))?;
        self.threads.push(handle);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Application interface
    // ------------------------------------------------------------------------

    /// Queues a payload for reliable, totally ordered delivery to the group.
    ///
    /// Blocks while the send queue is full. Sends made while the host is not
    /// in a group (or the group is frozen) are held until it resumes.
    pub fn send(&self, payload: impl Into<Bytes>) -> VsyncResult<()> {
        if self.is_shut_down() {
            return Err(VsyncError::ShutDown);
        }
        self.reliability.submit(payload.into())
    }

    /// Blocks until the next payload in delivery order is stable.
    pub fn receive_stable(&self) -> VsyncResult<Bytes> {
        self.queue
            .retrieve_stable()
            .map(|delivery| delivery.payload)
            .ok_or(VsyncError::ShutDown)
    }

    /// Like [`Group::receive_stable`], returning `Ok(None)` after `timeout`.
    pub fn receive_stable_timeout(&self, timeout: Duration) -> VsyncResult<Option<Bytes>> {
        Ok(self.receive_delivery_timeout(timeout)?.map(|d| d.payload))
    }

    /// The next delivery with its timestamp and ID.
    pub fn receive_delivery_timeout(&self, timeout: Duration) -> VsyncResult<Option<Delivery>> {
        if self.is_shut_down() {
            return Err(VsyncError::ShutDown);
        }
        Ok(self.queue.retrieve_stable_timeout(timeout))
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn local(&self) -> HostId {
        self.local
    }

    /// The other hosts in the current view.
    pub fn members(&self) -> Vec<HostId> {
        self.view.member_ids()
    }

    pub fn view(&self) -> View {
        self.view.snapshot()
    }

    pub fn status(&self) -> ViewStatus {
        self.view.status()
    }

    pub fn manager(&self) -> Option<HostId> {
        self.view.manager()
    }

    pub fn is_manager(&self) -> bool {
        self.view.is_manager()
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.view.process_id()
    }

    pub fn reliability(&self) -> &ReliabilityLayer {
        &self.reliability
    }

    pub fn recovery(&self) -> &FaultRecovery {
        &self.recovery
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops every thread and closes the transport.
    pub fn shutdown(&mut self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(host = %self.local, "shutting down group member");

        self.transport.close();
        let _ = self.inbox.send(ViewInput::Shutdown);
        self.reliability.close();
        self.recovery.close();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!(host = %self.local, "group thread panicked");
            }
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("local", &self.local)
            .field("status", &self.status())
            .field("members", &self.members())
            .finish_non_exhaustive()
    }
}

/// Forwards link events to the view manager. A lost link is purged from the
/// reliability layer first so nothing keeps waiting on it.
fn pump_link_events(
    transport: &dyn Transport,
    reliability: &ReliabilityLayer,
    inbox: &Sender<ViewInput>,
) {
    loop {
        match transport.next_event() {
            Ok(event) => {
                if let LinkEvent::Lost(host) = &event {
                    reliability.handle_disconnection(*host);
                }
                if inbox.send(ViewInput::Link(event)).is_err() {
                    break;
                }
            }
            Err(TransportError::Closed) => break,
            Err(e) => warn!(error = %e, "link event failed"),
        }
    }
    debug!("link event pump stopped");
}
