//! In-process transport for tests and simulation.
//!
//! A [`MemoryNetwork`] is a hub shared by any number of [`MemoryTransport`]
//! endpoints. Links, discovery and failures behave like the TCP transport,
//! but everything happens through channels, so multi-host scenarios run in
//! one test process without sockets.
//!
//! Fault injection:
//! - [`MemoryNetwork::isolate`]: traffic to and from a host is silently
//!   dropped while its links stay up (a hung process).
//! - [`MemoryNetwork::sever`]: a single link breaks; both ends observe
//!   [`LinkEvent::Lost`].
//! - [`MemoryNetwork::crash`]: the endpoint disappears; every peer observes
//!   [`LinkEvent::Lost`].

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};
use vsync_types::{HostId, Presence};

use crate::{Inbound, LinkEvent, Transport, TransportError};

/// First fake port handed out to endpoints.
const FIRST_PORT: u16 = 20_000;

// ============================================================================
// Hub
// ============================================================================

#[derive(Debug)]
struct Endpoint {
    presence: Presence,
    addr: SocketAddr,
    inbound: Sender<Inbound>,
    events: Sender<LinkEvent>,
    links: HashSet<HostId>,
    advertising: bool,
    /// Distinguishes successive endpoints of the same host.
    epoch: u64,
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: HashMap<HostId, Endpoint>,
    isolated: HashSet<HostId>,
    disconnects: Vec<(HostId, HostId)>,
    next_port: u16,
    next_epoch: u64,
}

impl Hub {
    fn notify(&self, host: HostId, event: LinkEvent) {
        if let Some(endpoint) = self.endpoints.get(&host) {
            let _ = endpoint.events.send(event);
        }
    }

    fn unlink(&mut self, a: HostId, b: HostId) -> bool {
        let removed = self
            .endpoints
            .get_mut(&a)
            .map(|e| e.links.remove(&b))
            .unwrap_or(false);
        if let Some(e) = self.endpoints.get_mut(&b) {
            e.links.remove(&a);
        }
        removed
    }

    fn advert(&self, host: HostId) -> Option<LinkEvent> {
        self.endpoints.get(&host).map(|e| LinkEvent::Discovered {
            presence: e.presence,
            addr: e.addr,
        })
    }

    /// Drops an endpoint and tells every linked peer.
    fn remove(&mut self, host: HostId) {
        let Some(endpoint) = self.endpoints.remove(&host) else {
            return;
        };
        for peer in endpoint.links {
            if let Some(e) = self.endpoints.get_mut(&peer) {
                e.links.remove(&host);
                let _ = e.events.send(LinkEvent::Lost(host));
            }
        }
    }
}

// ============================================================================
// Network
// ============================================================================

/// A shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new endpoint announcing `presence`.
    ///
    /// An endpoint for the same host replaces the previous one, which is how
    /// tests model a crashed host coming back with its restored identity.
    pub fn endpoint(&self, presence: Presence) -> MemoryTransport {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();

        let mut hub = self.hub.lock().expect("lock poisoned");
        hub.remove(presence.host);
        let port = FIRST_PORT + hub.next_port;
        hub.next_port = hub.next_port.wrapping_add(1);
        let epoch = hub.next_epoch;
        hub.next_epoch += 1;
        hub.endpoints.insert(
            presence.host,
            Endpoint {
                presence,
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                inbound: inbound_tx,
                events: events_tx,
                links: HashSet::new(),
                advertising: false,
                epoch,
            },
        );

        MemoryTransport {
            local: presence,
            epoch,
            hub: Arc::clone(&self.hub),
            inbound: Mutex::new(inbound_rx),
            events: Mutex::new(events_rx),
        }
    }

    /// Silently drops all traffic to and from `host`. Links stay up.
    pub fn isolate(&self, host: HostId) {
        self.hub.lock().expect("lock poisoned").isolated.insert(host);
    }

    /// Lifts an isolation.
    pub fn heal(&self, host: HostId) {
        self.hub.lock().expect("lock poisoned").isolated.remove(&host);
    }

    /// Breaks the link between `a` and `b`; both observe `Lost`.
    pub fn sever(&self, a: HostId, b: HostId) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        if hub.unlink(a, b) {
            hub.notify(a, LinkEvent::Lost(b));
            hub.notify(b, LinkEvent::Lost(a));
        }
    }

    /// Removes `host` from the network as if its process died.
    pub fn crash(&self, host: HostId) {
        self.hub.lock().expect("lock poisoned").remove(host);
    }

    /// Hosts that `host` has explicitly disconnected, in call order.
    pub fn disconnects_by(&self, host: HostId) -> Vec<HostId> {
        self.hub
            .lock()
            .expect("lock poisoned")
            .disconnects
            .iter()
            .filter(|(by, _)| *by == host)
            .map(|(_, peer)| *peer)
            .collect()
    }

    /// Current links of `host`.
    pub fn links_of(&self, host: HostId) -> HashSet<HostId> {
        self.hub
            .lock()
            .expect("lock poisoned")
            .endpoints
            .get(&host)
            .map(|e| e.links.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// Endpoint Transport
// ============================================================================

/// One host's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    local: Presence,
    epoch: u64,
    hub: Arc<Mutex<Hub>>,
    inbound: Mutex<Receiver<Inbound>>,
    events: Mutex<Receiver<LinkEvent>>,
}

impl MemoryTransport {
    /// True while this endpoint (not a later one for the same host) is
    /// registered on the hub.
    fn attached(&self, hub: &Hub) -> bool {
        hub.endpoints
            .get(&self.local.host)
            .is_some_and(|e| e.epoch == self.epoch)
    }
}

impl Transport for MemoryTransport {
    fn local(&self) -> Presence {
        self.local
    }

    fn send(&self, to: HostId, payload: Bytes) -> Result<(), TransportError> {
        let hub = self.hub.lock().expect("lock poisoned");
        if !self.attached(&hub) {
            return Err(TransportError::Closed);
        }
        if !hub.endpoints[&self.local.host].links.contains(&to) {
            return Err(TransportError::NotConnected(to));
        }
        if hub.isolated.contains(&self.local.host) || hub.isolated.contains(&to) {
            trace!(from = %self.local.host, %to, "dropped by isolation");
            return Ok(());
        }

        let peer = hub
            .endpoints
            .get(&to)
            .ok_or(TransportError::Disconnected(to))?;
        peer.inbound
            .send(Inbound {
                from: self.local.host,
                payload,
            })
            .map_err(|_| TransportError::Disconnected(to))
    }

    fn receive(&self) -> Result<Inbound, TransportError> {
        self.inbound
            .lock()
            .expect("lock poisoned")
            .recv()
            .map_err(|_| TransportError::Closed)
    }

    fn next_event(&self) -> Result<LinkEvent, TransportError> {
        self.events
            .lock()
            .expect("lock poisoned")
            .recv()
            .map_err(|_| TransportError::Closed)
    }

    fn connected(&self) -> Vec<HostId> {
        let hub = self.hub.lock().expect("lock poisoned");
        if !self.attached(&hub) {
            return Vec::new();
        }
        hub.endpoints[&self.local.host].links.iter().copied().collect()
    }

    fn peer_addr(&self, host: HostId) -> Option<SocketAddr> {
        let hub = self.hub.lock().expect("lock poisoned");
        if !self.attached(&hub) || !hub.endpoints[&self.local.host].links.contains(&host) {
            return None;
        }
        hub.endpoints.get(&host).map(|e| e.addr)
    }

    fn disconnect(&self, host: HostId) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        if !self.attached(&hub) {
            return;
        }
        hub.disconnects.push((self.local.host, host));
        if hub.unlink(self.local.host, host) {
            debug!(from = %self.local.host, peer = %host, "disconnected");
            hub.notify(host, LinkEvent::Lost(self.local.host));
        }
    }

    fn open_connection(&self, addr: SocketAddr, host: HostId) -> Result<(), TransportError> {
        let mut hub = self.hub.lock().expect("lock poisoned");
        if !self.attached(&hub) {
            return Err(TransportError::Closed);
        }
        let reachable = hub.endpoints.get(&host).is_some_and(|e| e.addr == addr)
            && !hub.isolated.contains(&host)
            && !hub.isolated.contains(&self.local.host);
        if !reachable {
            return Err(TransportError::Io(io::Error::from(ErrorKind::ConnectionRefused)));
        }

        let me = self.local.host;
        let fresh = hub
            .endpoints
            .get_mut(&me)
            .map(|e| e.links.insert(host))
            .unwrap_or(false);
        if let Some(peer) = hub.endpoints.get_mut(&host) {
            peer.links.insert(me);
        }
        if fresh {
            debug!(from = %me, peer = %host, "link opened");
            hub.notify(
                host,
                LinkEvent::Accepted {
                    presence: self.local,
                },
            );
        }
        Ok(())
    }

    fn start_discovery(&self) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        if !self.attached(&hub) {
            return;
        }
        let me = self.local.host;
        if let Some(e) = hub.endpoints.get_mut(&me) {
            e.advertising = true;
        }
        if hub.isolated.contains(&me) {
            return;
        }

        // Everyone hears our beacon; we hear everyone still advertising.
        let others: Vec<HostId> = hub.endpoints.keys().copied().filter(|h| *h != me).collect();
        if let Some(advert) = hub.advert(me) {
            for other in &others {
                if !hub.isolated.contains(other) {
                    hub.notify(*other, advert.clone());
                }
            }
        }
        for other in others {
            let advertising = hub.endpoints.get(&other).is_some_and(|e| e.advertising);
            if advertising && !hub.isolated.contains(&other) {
                if let Some(advert) = hub.advert(other) {
                    hub.notify(me, advert);
                }
            }
        }
    }

    fn stop_discovery(&self) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        if !self.attached(&hub) {
            return;
        }
        if let Some(e) = hub.endpoints.get_mut(&self.local.host) {
            e.advertising = false;
        }
    }

    fn close(&self) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        // A newer endpoint for the same host stays registered.
        if self.attached(&hub) {
            hub.remove(self.local.host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsync_types::Ticket;

    fn presence(ticket: u32) -> Presence {
        Presence::new(HostId::generate(), Ticket::new(ticket))
    }

    fn linked_pair(net: &MemoryNetwork) -> (MemoryTransport, MemoryTransport) {
        let a = net.endpoint(presence(1));
        let b = net.endpoint(presence(2));
        b.start_discovery();
        let addr = match a.next_event().expect("discovered") {
            LinkEvent::Discovered { addr, .. } => addr,
            other => panic!("unexpected event: {other:?}"),
        };
        a.open_connection(addr, b.local().host).expect("connect");
        (a, b)
    }

    #[test]
    fn discovery_reaches_existing_and_later_advertisers() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(presence(1));
        let b = net.endpoint(presence(2));

        a.start_discovery();
        b.start_discovery();

        match a.next_event().expect("event") {
            LinkEvent::Discovered { presence, .. } => assert_eq!(presence, b.local()),
            other => panic!("unexpected event: {other:?}"),
        }
        match b.next_event().expect("event") {
            LinkEvent::Discovered { presence, .. } => assert_eq!(presence, a.local()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn open_connection_announces_the_dialer() {
        let net = MemoryNetwork::new();
        let (a, b) = linked_pair(&net);

        assert_eq!(
            b.next_event().expect("event"),
            LinkEvent::Accepted { presence: a.local() }
        );
        assert_eq!(a.connected(), vec![b.local().host]);
        assert_eq!(b.connected(), vec![a.local().host]);

        a.send(b.local().host, Bytes::from_static(b"hi")).expect("send");
        let got = b.receive().expect("receive");
        assert_eq!(got.from, a.local().host);
    }

    #[test]
    fn isolation_drops_traffic_but_keeps_links() {
        let net = MemoryNetwork::new();
        let (a, b) = linked_pair(&net);
        net.isolate(b.local().host);

        a.send(b.local().host, Bytes::from_static(b"lost")).expect("send");
        net.heal(b.local().host);
        a.send(b.local().host, Bytes::from_static(b"kept")).expect("send");

        assert_eq!(b.receive().expect("receive").payload, Bytes::from_static(b"kept"));
        assert!(a.is_connected());
    }

    #[test]
    fn disconnect_is_recorded_and_seen_remotely() {
        let net = MemoryNetwork::new();
        let (a, b) = linked_pair(&net);
        assert!(matches!(b.next_event(), Ok(LinkEvent::Accepted { .. })));

        a.disconnect(b.local().host);

        assert_eq!(net.disconnects_by(a.local().host), vec![b.local().host]);
        assert_eq!(b.next_event().expect("event"), LinkEvent::Lost(a.local().host));
        assert!(matches!(
            a.send(b.local().host, Bytes::new()),
            Err(TransportError::NotConnected(_))
        ));
    }

    #[test]
    fn crash_notifies_peers_and_closes_endpoint() {
        let net = MemoryNetwork::new();
        let (a, b) = linked_pair(&net);

        net.crash(b.local().host);

        assert_eq!(a.next_event().expect("event"), LinkEvent::Lost(b.local().host));
        assert!(matches!(b.receive(), Err(TransportError::Closed)));
    }
}
