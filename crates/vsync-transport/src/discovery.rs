//! UDP broadcast beacons.
//!
//! A host that has not joined a group periodically broadcasts an advert
//! carrying its [`Presence`] and the TCP port it accepts links on. Every
//! transport listens on the same discovery port and turns adverts from other
//! hosts into [`LinkEvent::Discovered`].

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use vsync_types::Presence;

use crate::framing::{FrameDecoder, FrameEncoder};
use crate::{LinkEvent, TransportError};

/// Largest advert datagram we accept.
const DATAGRAM_SIZE: usize = 512;

#[derive(Debug, Serialize, Deserialize)]
struct Advert {
    presence: Presence,
    port: u16,
}

/// The discovery socket plus the broadcast schedule.
#[derive(Debug)]
pub(crate) struct Beacon {
    socket: UdpSocket,
    target: SocketAddr,
    local: Presence,
    /// Pre-encoded advert frame.
    advert: Vec<u8>,
    interval: Duration,
    /// Next broadcast time; `None` while not advertising.
    next_at: Option<Instant>,
}

impl Beacon {
    pub(crate) fn bind(
        port: u16,
        broadcast_ip: IpAddr,
        local: Presence,
        tcp_port: u16,
        interval: Duration,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
        socket.set_broadcast(true)?;

        let advert = FrameEncoder::new().encode(&Advert {
            presence: local,
            port: tcp_port,
        })?;

        debug!(port, "discovery socket bound");
        Ok(Self {
            socket,
            target: SocketAddr::new(broadcast_ip, port),
            local,
            advert,
            interval,
            next_at: None,
        })
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.socket, token, Interest::READABLE)
    }

    /// Turns advertising on or off. Switching on schedules an immediate
    /// broadcast.
    pub(crate) fn set_advertising(&mut self, on: bool) {
        match (on, self.next_at) {
            (true, None) => self.next_at = Some(Instant::now()),
            (false, Some(_)) => self.next_at = None,
            _ => {}
        }
    }

    /// How long the poll loop may sleep before the next broadcast is due.
    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.next_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Broadcasts the advert if it is due.
    pub(crate) fn tick(&mut self) {
        let Some(at) = self.next_at else { return };
        let now = Instant::now();
        if now < at {
            return;
        }

        match self.socket.send_to(&self.advert, self.target) {
            Ok(_) => trace!(target = %self.target, "advert sent"),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "advert broadcast failed"),
        }
        self.next_at = Some(now + self.interval);
    }

    /// Reads every pending datagram and returns the adverts of other hosts.
    pub(crate) fn drain(&mut self) -> Vec<LinkEvent> {
        let mut found = Vec::new();
        let mut buf = [0u8; DATAGRAM_SIZE];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, source)) => {
                    let mut decoder = FrameDecoder::with_max_size(DATAGRAM_SIZE as u32);
                    decoder.extend(&buf[..n]);
                    match decoder.decode::<Advert>() {
                        Ok(Some(advert)) if advert.presence.host != self.local.host => {
                            found.push(LinkEvent::Discovered {
                                presence: advert.presence,
                                addr: SocketAddr::new(source.ip(), advert.port),
                            });
                        }
                        Ok(_) => {}
                        Err(e) => debug!(%source, error = %e, "ignoring malformed advert"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "discovery socket read failed");
                    break;
                }
            }
        }

        found
    }
}
