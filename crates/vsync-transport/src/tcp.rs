//! TCP mesh transport with UDP discovery.
//!
//! # Design
//!
//! - One mio poll thread per transport owns the listener, the discovery
//!   socket and the readiness notifications of every peer link.
//! - Peer links live in a shared table so that [`Transport::send`] writes
//!   directly from the calling thread. The poll thread only finishes writes
//!   that hit `WouldBlock`.
//! - Every link starts with a `Hello` frame carrying the dialer's
//!   [`Presence`]; payload frames are only accepted after it.
//! - Decoded payloads are pushed to a bounded channel outside the link lock,
//!   so a slow consumer applies backpressure to the sockets and never to
//!   senders.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{self, IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};
use vsync_types::{HostId, Presence};

use crate::discovery::Beacon;
use crate::framing::{FrameDecoder, FrameEncoder};
use crate::{Inbound, LinkEvent, Transport, TransportError};

// ============================================================================
// Constants
// ============================================================================

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const DISCOVERY_TOKEN: Token = Token(2);

/// Peer links are numbered from here.
const FIRST_LINK_TOKEN: usize = 16;

const READ_BUFFER_SIZE: usize = 8 * 1024;

const MAX_EVENTS: usize = 128;

/// Default UDP port for discovery beacons.
pub const DEFAULT_DISCOVERY_PORT: u16 = 4445;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration of a [`TcpTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Address the link listener binds to. Port 0 picks a free port.
    pub listen_addr: SocketAddr,

    /// UDP port for discovery beacons. `None` disables discovery.
    pub discovery_port: Option<u16>,

    /// Destination address of discovery broadcasts.
    pub broadcast_addr: IpAddr,

    /// Time between two beacons while advertising.
    pub discovery_interval: Duration,

    /// Upper bound for establishing an outbound link.
    pub connect_timeout: Duration,

    /// Received payloads buffered before the poll thread stops reading.
    pub inbound_capacity: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            discovery_port: Some(DEFAULT_DISCOVERY_PORT),
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            inbound_capacity: 1024,
        }
    }
}

impl TcpConfig {
    /// Loopback-only links, no discovery, short timeouts.
    pub fn development() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            discovery_port: None,
            discovery_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    pub fn production() -> Self {
        Self::default()
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = Some(port);
        self
    }

    pub fn without_discovery(mut self) -> Self {
        self.discovery_port = None;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

// ============================================================================
// Wire Packets
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
enum Packet {
    /// First frame of every link: who is dialing and where it listens.
    Hello { presence: Presence, port: u16 },
    Payload(Bytes),
}

// ============================================================================
// Peer Links
// ============================================================================

#[derive(Debug)]
struct Link {
    stream: TcpStream,
    /// Known once the dialer's hello arrived (or immediately for links we
    /// dialed).
    host: Option<HostId>,
    /// Where the remote end accepts links.
    listen_addr: Option<SocketAddr>,
    /// Source address of an accepted socket.
    remote: Option<SocketAddr>,
    decoder: FrameDecoder,
    write_buffer: Vec<u8>,
}

impl Link {
    fn dialed(stream: TcpStream, host: HostId, addr: SocketAddr) -> Self {
        Self {
            stream,
            host: Some(host),
            listen_addr: Some(addr),
            remote: Some(addr),
            decoder: FrameDecoder::new(),
            write_buffer: Vec::new(),
        }
    }

    fn accepted(stream: TcpStream, remote: SocketAddr) -> Self {
        Self {
            stream,
            host: None,
            listen_addr: None,
            remote: Some(remote),
            decoder: FrameDecoder::new(),
            write_buffer: Vec::new(),
        }
    }

    /// Writes as much of the buffer as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => {
                    self.write_buffer.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads until `WouldBlock`. Returns the decoded packets and whether the
    /// link is still open.
    fn read_packets(&mut self) -> io::Result<(Vec<Packet>, bool)> {
        let mut packets = Vec::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    if self.decoder.buffered() > 0 {
                        debug!(
                            bytes = self.decoder.buffered(),
                            "peer closed in the middle of a frame"
                        );
                    }
                    return Ok((packets, false));
                }
                Ok(n) => {
                    self.decoder.extend(&buf[..n]);
                    loop {
                        match self.decoder.decode::<Packet>() {
                            Ok(Some(packet)) => packets.push(packet),
                            Ok(None) => break,
                            Err(e) if e.is_fatal() => {
                                return Err(io::Error::new(ErrorKind::InvalidData, e.to_string()))
                            }
                            Err(e) => {
                                warn!(error = %e, "frame decode error");
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok((packets, true)),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug)]
struct Links {
    by_token: HashMap<Token, Link>,
    by_host: HashMap<HostId, Token>,
    next_token: usize,
}

impl Links {
    fn new() -> Self {
        Self {
            by_token: HashMap::new(),
            by_host: HashMap::new(),
            next_token: FIRST_LINK_TOKEN,
        }
    }

    fn insert(&mut self, mut link: Link, registry: &Registry) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        registry.register(
            &mut link.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        if let Some(host) = link.host {
            self.by_host.insert(host, token);
        }
        self.by_token.insert(token, link);
        Ok(token)
    }

    /// Removes and closes a link. Returns the host it was the live link of,
    /// if any.
    fn remove(&mut self, token: Token, registry: &Registry) -> Option<HostId> {
        let mut link = self.by_token.remove(&token)?;
        let _ = registry.deregister(&mut link.stream);
        let _ = link.stream.shutdown(Shutdown::Both);

        let host = link.host?;
        if self.by_host.get(&host) == Some(&token) {
            self.by_host.remove(&host);
            Some(host)
        } else {
            None
        }
    }

    fn close_all(&mut self, registry: &Registry) {
        let tokens: Vec<Token> = self.by_token.keys().copied().collect();
        for token in tokens {
            self.remove(token, registry);
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Debug)]
struct Shared {
    local: Presence,
    config: TcpConfig,
    encoder: FrameEncoder,
    registry: Registry,
    waker: Waker,
    links: Mutex<Links>,
    inbound_tx: Mutex<Option<SyncSender<Inbound>>>,
    events_tx: Mutex<Option<Sender<LinkEvent>>>,
    advertising: AtomicBool,
    running: AtomicBool,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        if let Some(tx) = self.events_tx.lock().expect("lock poisoned").as_ref() {
            let _ = tx.send(event);
        }
    }

    fn deliver(&self, inbound: Vec<Inbound>) {
        if inbound.is_empty() {
            return;
        }
        let tx = self.inbound_tx.lock().expect("lock poisoned").clone();
        if let Some(tx) = tx {
            for item in inbound {
                if tx.send(item).is_err() {
                    break;
                }
            }
        }
    }

    fn accept_links(&self, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%addr, error = %e, "set_nodelay failed");
                    }
                    let mut links = self.links.lock().expect("lock poisoned");
                    match links.insert(Link::accepted(stream, addr), &self.registry) {
                        Ok(token) => trace!(%addr, token = token.0, "accepted link"),
                        Err(e) => warn!(%addr, error = %e, "failed to register accepted link"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Handles readiness of one peer link.
    fn service(&self, token: Token, readable: bool, writable: bool) {
        let mut inbound = Vec::new();
        let mut events = Vec::new();

        {
            let mut links = self.links.lock().expect("lock poisoned");
            let mut introduced = None;
            let mut failed = false;

            if let Some(link) = links.by_token.get_mut(&token) {
                if writable {
                    if let Err(e) = link.flush() {
                        debug!(token = token.0, error = %e, "write failed");
                        failed = true;
                    }
                }

                if readable && !failed {
                    match link.read_packets() {
                        Ok((packets, open)) => {
                            for packet in packets {
                                match packet {
                                    Packet::Hello { presence, port } => {
                                        link.host = Some(presence.host);
                                        link.listen_addr =
                                            link.remote.map(|r| SocketAddr::new(r.ip(), port));
                                        introduced = Some(presence);
                                    }
                                    Packet::Payload(payload) => match link.host {
                                        Some(from) => inbound.push(Inbound { from, payload }),
                                        None => warn!(token = token.0, "payload before hello"),
                                    },
                                }
                            }
                            failed = !open;
                        }
                        Err(e) => {
                            debug!(token = token.0, error = %e, "read failed");
                            failed = true;
                        }
                    }
                }
            } else {
                return;
            }

            if let Some(presence) = introduced {
                // The newest link to a host replaces any stale one.
                if let Some(previous) = links.by_host.insert(presence.host, token) {
                    if previous != token {
                        links.remove(previous, &self.registry);
                    }
                }
                debug!(peer = %presence.host, "link accepted");
                events.push(LinkEvent::Accepted { presence });
            }

            if failed {
                if let Some(host) = links.remove(token, &self.registry) {
                    info!(peer = %host, "link lost");
                    events.push(LinkEvent::Lost(host));
                }
            }
        }

        // Payloads that arrived before a loss are still handed up first.
        self.deliver(inbound);
        for event in events {
            self.emit(event);
        }
    }
}

// ============================================================================
// Poll Thread
// ============================================================================

struct PollLoop {
    poll: Poll,
    listener: TcpListener,
    beacon: Option<Beacon>,
    shared: Arc<Shared>,
}

impl PollLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.shared.running.load(Ordering::Acquire) {
            let advertising = self.shared.advertising.load(Ordering::Acquire);
            let timeout = self.beacon.as_mut().and_then(|beacon| {
                beacon.set_advertising(advertising);
                beacon.timeout()
            });

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed, transport stopping");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => self.shared.accept_links(&self.listener),
                    DISCOVERY_TOKEN => {
                        if let Some(beacon) = self.beacon.as_mut() {
                            for found in beacon.drain() {
                                self.shared.emit(found);
                            }
                        }
                    }
                    token => self.shared.service(
                        token,
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable(),
                    ),
                }
            }

            if let Some(beacon) = self.beacon.as_mut() {
                beacon.tick();
            }
        }

        debug!("poll thread exiting");
    }
}

// ============================================================================
// TCP Transport
// ============================================================================

/// TCP links between group hosts plus UDP broadcast discovery.
///
/// # Example
///
/// ```ignore
/// use vsync_transport::{TcpConfig, TcpTransport, Transport};
/// use vsync_types::{HostId, Presence, Ticket};
///
/// let local = Presence::new(HostId::generate(), Ticket::random());
/// let transport = TcpTransport::bind(TcpConfig::production(), local)?;
/// transport.start_discovery();
/// ```
pub struct TcpTransport {
    shared: Arc<Shared>,
    listen_addr: SocketAddr,
    inbound: Mutex<Receiver<Inbound>>,
    events: Mutex<Receiver<LinkEvent>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Binds the listener (and the discovery socket, if enabled) and starts
    /// the poll thread.
    ///
    /// # Errors
    ///
    /// Fails if either socket cannot be bound.
    pub fn bind(config: TcpConfig, local: Presence) -> Result<Self, TransportError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let mut listener = TcpListener::bind(config.listen_addr)?;
        let listen_addr = listener.local_addr()?;
        registry.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let beacon = match config.discovery_port {
            Some(port) => {
                let mut beacon = Beacon::bind(
                    port,
                    config.broadcast_addr,
                    local,
                    listen_addr.port(),
                    config.discovery_interval,
                )?;
                beacon.register(&registry, DISCOVERY_TOKEN)?;
                Some(beacon)
            }
            None => None,
        };

        let (inbound_tx, inbound_rx) = mpsc::sync_channel(config.inbound_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel();

        let shared = Arc::new(Shared {
            local,
            config,
            encoder: FrameEncoder::new(),
            registry,
            waker,
            links: Mutex::new(Links::new()),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            events_tx: Mutex::new(Some(events_tx)),
            advertising: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });

        let poll_loop = PollLoop {
            poll,
            listener,
            beacon,
            shared: Arc::clone(&shared),
        };
        let poller = thread::Builder::new()
            .name(format!("vsync-net-{}", local.host))
            .spawn(move || poll_loop.run())?;

        info!(host = %local.host, addr = %listen_addr, "transport listening");

        Ok(Self {
            shared,
            listen_addr,
            inbound: Mutex::new(inbound_rx),
            events: Mutex::new(events_rx),
            poller: Mutex::new(Some(poller)),
        })
    }

    fn hello(&self) -> Packet {
        Packet::Hello {
            presence: self.shared.local,
            port: self.listen_addr.port(),
        }
    }

    /// The address the link listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.shared.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "failed to wake poll thread");
        }
    }
}

impl Transport for TcpTransport {
    fn local(&self) -> Presence {
        self.shared.local
    }

    fn send(&self, to: HostId, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_running()?;
        let frame = self.shared.encoder.encode(&Packet::Payload(payload))?;

        let mut links = self.shared.links.lock().expect("lock poisoned");
        let token = *links
            .by_host
            .get(&to)
            .ok_or(TransportError::NotConnected(to))?;
        let link = links
            .by_token
            .get_mut(&token)
            .ok_or(TransportError::NotConnected(to))?;

        link.write_buffer.extend_from_slice(&frame);
        if let Err(e) = link.flush() {
            warn!(peer = %to, error = %e, "write failed, dropping link");
            links.remove(token, &self.shared.registry);
            return Err(TransportError::Disconnected(to));
        }

        trace!(peer = %to, bytes = frame.len(), "sent");
        Ok(())
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
        let links = self.shared.links.lock().expect("lock poisoned");
        links.by_host.keys().copied().collect()
    }

    fn peer_addr(&self, host: HostId) -> Option<SocketAddr> {
        let links = self.shared.links.lock().expect("lock poisoned");
        let token = links.by_host.get(&host)?;
        links.by_token.get(token)?.listen_addr
    }

    fn disconnect(&self, host: HostId) {
        let mut links = self.shared.links.lock().expect("lock poisoned");
        if let Some(token) = links.by_host.get(&host).copied() {
            links.remove(token, &self.shared.registry);
            debug!(peer = %host, "disconnected");
        }
    }

    fn open_connection(&self, addr: SocketAddr, host: HostId) -> Result<(), TransportError> {
        self.ensure_running()?;
        if self
            .shared
            .links
            .lock()
            .expect("lock poisoned")
            .by_host
            .contains_key(&host)
        {
            return Ok(());
        }

        let mut stream = net::TcpStream::connect_timeout(&addr, self.shared.config.connect_timeout)?;
        stream.set_nodelay(true)?;
        self.shared.encoder.encode_to(&self.hello(), &mut stream)?;
        stream.set_nonblocking(true)?;

        let mut links = self.shared.links.lock().expect("lock poisoned");
        if links.by_host.contains_key(&host) {
            // The peer dialed us while we were connecting.
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }
        links.insert(
            Link::dialed(TcpStream::from_std(stream), host, addr),
            &self.shared.registry,
        )?;

        debug!(peer = %host, %addr, "link opened");
        Ok(())
    }

    fn start_discovery(&self) {
        if self.shared.config.discovery_port.is_none() {
            debug!("discovery disabled, not advertising");
            return;
        }
        if !self.shared.advertising.swap(true, Ordering::AcqRel) {
            debug!("advertising started");
            self.wake();
        }
    }

    fn stop_discovery(&self) {
        if self.shared.advertising.swap(false, Ordering::AcqRel) {
            debug!("advertising stopped");
            self.wake();
        }
    }

    fn close(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shared.inbound_tx.lock().expect("lock poisoned").take();
        self.shared.events_tx.lock().expect("lock poisoned").take();
        self.shared
            .links
            .lock()
            .expect("lock poisoned")
            .close_all(&self.shared.registry);
        self.wake();

        let handle = self.poller.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("poll thread panicked");
            }
        }
        info!(host = %self.shared.local.host, "transport closed");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.shared.local.host)
            .field("listen_addr", &self.listen_addr)
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
