//! # vsync-transport: host discovery and point-to-point links
//!
//! This crate is the bottom of the vsync stack. It knows nothing about views,
//! acknowledgments or checkpoints; it moves opaque byte payloads between
//! hosts that are identified by [`HostId`] and reports link changes.
//!
//! ## Implementations
//!
//! - [`TcpTransport`]: a full mesh of TCP links driven by one mio poll
//!   thread, plus UDP broadcast beacons for discovery.
//! - [`MemoryNetwork`]: an in-process network for tests, with fault
//!   injection (isolated hosts, severed links, crashes).
//!
//! ## Design
//!
//! The transport is best-effort. A payload may be lost if a link breaks, and
//! no acknowledgment is ever produced here: the reliability layer above is
//! responsible for retries and stability. Link failures are surfaced either
//! as an error from [`Transport::send`] or as [`LinkEvent::Lost`].

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::debug;
use vsync_types::{HostId, Presence};

pub mod framing;
pub mod memory;
pub mod tcp;

mod discovery;

pub use framing::{FrameDecoder, FrameEncoder, FramingError, HEADER_SIZE};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpConfig, TcpTransport};

// ============================================================================
// Transport Events
// ============================================================================

/// A payload received from a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The peer the payload arrived from.
    pub from: HostId,
    /// The opaque payload.
    pub payload: Bytes,
}

/// Changes in the set of reachable hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A discovery beacon was heard from a host we may not be linked to.
    Discovered {
        presence: Presence,
        /// Address the host accepts connections on.
        addr: SocketAddr,
    },

    /// A remote host opened a link to us and introduced itself.
    Accepted { presence: Presence },

    /// A link broke (remote close or I/O failure).
    Lost(HostId),
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// There is no link to the host.
    #[error("not connected to {0}")]
    NotConnected(HostId),

    /// Writing to the host failed; the link has been dropped.
    #[error("link to {0} failed and was dropped")]
    Disconnected(HostId),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be encoded or decoded.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Best-effort, point-to-point message transport between hosts.
///
/// Implementations are shared between the threads of the stack, so every
/// method takes `&self`. [`Transport::receive`] and [`Transport::next_event`]
/// block; each is expected to have exactly one consuming thread.
pub trait Transport: Debug + Send + Sync {
    /// Returns the identity this transport announces to peers.
    fn local(&self) -> Presence;

    /// Sends a payload to a linked host.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] if no link to `to` exists
    /// - [`TransportError::Disconnected`] if the write failed; the link is
    ///   dropped before returning
    fn send(&self, to: HostId, payload: Bytes) -> Result<(), TransportError>;

    /// Sends a payload to every currently linked host.
    ///
    /// Failures on individual links are logged and skipped. Only a closed
    /// transport is reported.
    fn broadcast(&self, payload: Bytes) -> Result<(), TransportError> {
        for peer in self.connected() {
            match self.send(peer, payload.clone()) {
                Ok(()) => {}
                Err(TransportError::Closed) => return Err(TransportError::Closed),
                Err(e) => debug!(peer = %peer, error = %e, "broadcast skipped peer"),
            }
        }
        Ok(())
    }

    /// Blocks until the next payload arrives.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport is closed.
    fn receive(&self) -> Result<Inbound, TransportError>;

    /// Blocks until the next link event.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport is closed.
    fn next_event(&self) -> Result<LinkEvent, TransportError>;

    /// Returns the hosts we currently hold a link to.
    fn connected(&self) -> Vec<HostId>;

    /// Returns the address a linked host accepts connections on.
    fn peer_addr(&self, host: HostId) -> Option<SocketAddr>;

    /// Returns true if at least one peer link exists.
    fn is_connected(&self) -> bool {
        !self.connected().is_empty()
    }

    /// Closes and forgets the link to a host.
    ///
    /// The remote end observes [`LinkEvent::Lost`]; the local end does not.
    fn disconnect(&self, host: HostId);

    /// Opens a link to `host` listening on `addr` and introduces ourselves.
    ///
    /// Opening a link that already exists is a no-op.
    fn open_connection(&self, addr: SocketAddr, host: HostId) -> Result<(), TransportError>;

    /// Starts announcing this host to the network.
    fn start_discovery(&self);

    /// Stops announcing this host (called once it has joined a group).
    fn stop_discovery(&self);

    /// Shuts the transport down, unblocking `receive` and `next_event`.
    fn close(&self);
}
