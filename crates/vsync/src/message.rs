//! Wire messages.
//!
//! Everything hosts exchange travels inside a [`ReliabilityMessage`]:
//!
//! ## Reliability envelope
//! - `Data`: broadcast to a destination set; every recipient acknowledges to
//!   the origin and to every other recipient
//! - `Single`: sent to exactly one host, acknowledged by unicast
//! - `Ack`: acknowledges a `Data`/`Single` message
//!
//! ## Payloads
//! - [`Payload::Application`]: opaque bytes from [`crate::Group::send`]
//! - [`Payload::View`]: membership and recovery control ([`ViewMessage`])
//!
//! Encoding is bincode over serde; the enum tags are the discriminants.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use vsync_types::{CheckpointId, HostId, MessageId, Presence, ProcessId, ScalarClock};

use crate::recovery::Checkpoint;
use crate::view::Member;
use crate::{VsyncError, VsyncResult};

// ============================================================================
// Reliability Envelope
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Data,
    Ack,
    Single,
}

/// The unit of reliable delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityMessage {
    pub id: MessageId,

    /// Equals `id` for `Data`/`Single`; names the acknowledged message for
    /// `Ack`.
    pub reference_id: MessageId,

    /// Host that emitted this envelope.
    pub sender: HostId,

    /// Host that emitted the referenced message. Equals `sender` except for
    /// acknowledgments.
    pub origin: HostId,

    /// Hosts the referenced message was sent to (the origin excluded).
    pub destinations: Vec<HostId>,

    pub kind: MessageKind,

    /// `None` only for `Ack`.
    pub payload: Option<Payload>,

    pub timestamp: ScalarClock,
}

impl ReliabilityMessage {
    /// A message acknowledged by every destination and seen by all of them.
    pub fn data(
        origin: HostId,
        destinations: Vec<HostId>,
        payload: Payload,
        timestamp: ScalarClock,
    ) -> Self {
        Self::original(MessageKind::Data, origin, destinations, payload, timestamp)
    }

    /// A message for exactly one host.
    pub fn single(origin: HostId, to: HostId, payload: Payload, timestamp: ScalarClock) -> Self {
        Self::original(MessageKind::Single, origin, vec![to], payload, timestamp)
    }

    fn original(
        kind: MessageKind,
        origin: HostId,
        destinations: Vec<HostId>,
        payload: Payload,
        timestamp: ScalarClock,
    ) -> Self {
        let id = MessageId::generate();
        Self {
            id,
            reference_id: id,
            sender: origin,
            origin,
            destinations,
            kind,
            payload: Some(payload),
            timestamp,
        }
    }

    /// Acknowledgment of `message` sent by `acker`.
    pub fn ack(acker: HostId, message: &ReliabilityMessage, timestamp: ScalarClock) -> Self {
        Self {
            id: MessageId::generate(),
            reference_id: message.id,
            sender: acker,
            origin: message.origin,
            destinations: message.destinations.clone(),
            kind: MessageKind::Ack,
            payload: None,
            timestamp,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == MessageKind::Ack
    }

    /// Returns the control payload, if this is a view message.
    pub fn view_message(&self) -> Option<&ViewMessage> {
        match &self.payload {
            Some(Payload::View(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Hosts that must acknowledge this message before `host` may consider
    /// it stable.
    pub fn required_acks(&self, host: HostId) -> Vec<HostId> {
        self.destinations
            .iter()
            .copied()
            .filter(|h| *h != host && *h != self.origin)
            .collect()
    }

    pub fn encode(&self) -> VsyncResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| VsyncError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> VsyncResult<Self> {
        let message: Self =
            bincode::deserialize(bytes).map_err(|e| VsyncError::Codec(e.to_string()))?;
        if message.is_ack() != message.payload.is_none() {
            return Err(VsyncError::Codec(format!(
                "{:?} message with{} payload",
                message.kind,
                if message.payload.is_some() { "" } else { "out" }
            )));
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Application(Bytes),
    View(ViewMessage),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Application(_) => "Application",
            Payload::View(msg) => msg.name(),
        }
    }
}

// ============================================================================
// Delivered Messages
// ============================================================================

/// An application message as it is delivered, logged and checkpointed.
///
/// Ordered by timestamp, then message ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Delivery {
    pub timestamp: ScalarClock,
    pub id: MessageId,
    pub payload: Bytes,
}

impl Delivery {
    /// Extracts the application content of a message.
    pub fn from_message(message: &ReliabilityMessage) -> Option<Self> {
        match &message.payload {
            Some(Payload::Application(payload)) => Some(Self {
                timestamp: message.timestamp,
                id: message.id,
                payload: payload.clone(),
            }),
            _ => None,
        }
    }
}

impl Ord for Delivery {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Delivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// View Messages
// ============================================================================

/// Membership and recovery control traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewMessage {
    /// Joining host → higher-ticket host it dialed: please form a group with
    /// me (or admit me into yours).
    Advertise { presence: Presence },

    /// Manager → members: stop sending application messages.
    FreezeView,

    /// Manager → newcomer: everything it needs to join.
    InitialTopology {
        manager: HostId,
        process_id: ProcessId,
        /// Every current member, the manager included.
        topology: Vec<Member>,
        substitute: Option<HostId>,
        checkpoint_counter: CheckpointId,
    },

    /// Manager → members: connect to this newcomer.
    NewHost {
        newcomer: Member,
        substitute: Option<HostId>,
    },

    /// Member → newcomer: I am part of the view you are joining.
    ConnectRequest { process_id: ProcessId },

    /// Handshake completion, and membership-change completion towards the
    /// manager.
    Confirm,

    /// Manager → members: the change is done, resume sending.
    RestartView,

    /// Announces a removed host. From a member to the manager it is a
    /// failure report; from the manager it is authoritative.
    DisconnectedClient {
        host: HostId,
        manager: HostId,
        substitute: Option<HostId>,
    },

    /// Recovering host → manager: send me checkpoints after `after`.
    RecoveryRequest { after: Option<CheckpointId> },

    /// Manager → recovering host.
    RecoveryPacket { checkpoints: Vec<Checkpoint> },

    /// Manager → members: a group checkpoint was taken with this ID.
    Checkpoint { id: CheckpointId },
}

impl ViewMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ViewMessage::Advertise { .. } => "Advertise",
            ViewMessage::FreezeView => "FreezeView",
            ViewMessage::InitialTopology { .. } => "InitialTopology",
            ViewMessage::NewHost { .. } => "NewHost",
            ViewMessage::ConnectRequest { .. } => "ConnectRequest",
            ViewMessage::Confirm => "Confirm",
            ViewMessage::RestartView => "RestartView",
            ViewMessage::DisconnectedClient { .. } => "DisconnectedClient",
            ViewMessage::RecoveryRequest { .. } => "RecoveryRequest",
            ViewMessage::RecoveryPacket { .. } => "RecoveryPacket",
            ViewMessage::Checkpoint { .. } => "Checkpoint",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsync_types::Ticket;

    fn stamp(event: u64, process: u32) -> ScalarClock {
        ScalarClock::new(ProcessId::new(process), event)
    }

    #[test]
    fn ack_references_original() {
        let origin = HostId::generate();
        let peer = HostId::generate();
        let data = ReliabilityMessage::data(
            origin,
            vec![peer],
            Payload::Application(Bytes::from_static(b"x")),
            stamp(1, 0),
        );
        let ack = ReliabilityMessage::ack(peer, &data, stamp(2, 1));

        assert_eq!(data.reference_id, data.id);
        assert_eq!(ack.reference_id, data.id);
        assert_eq!(ack.origin, origin);
        assert_eq!(ack.sender, peer);
        assert_eq!(ack.destinations, data.destinations);
        assert!(ack.payload.is_none());
    }

    #[test]
    fn required_acks_exclude_self_and_origin() {
        let origin = HostId::generate();
        let a = HostId::generate();
        let b = HostId::generate();
        let msg = ReliabilityMessage::data(
            origin,
            vec![a, b],
            Payload::View(ViewMessage::FreezeView),
            stamp(3, 0),
        );

        assert_eq!(msg.required_acks(origin), vec![a, b]);
        assert_eq!(msg.required_acks(a), vec![b]);
    }

    #[test]
    fn single_message_needs_no_peer_acks_at_recipient() {
        let origin = HostId::generate();
        let to = HostId::generate();
        let msg = ReliabilityMessage::single(
            origin,
            to,
            Payload::View(ViewMessage::Confirm),
            stamp(1, 2),
        );

        assert_eq!(msg.kind, MessageKind::Single);
        assert!(msg.required_acks(to).is_empty());
        assert_eq!(msg.required_acks(origin), vec![to]);
    }

    #[test]
    fn view_payload_survives_encoding() {
        let presence = Presence::new(HostId::generate(), Ticket::new(7));
        let msg = ReliabilityMessage::single(
            presence.host,
            HostId::generate(),
            Payload::View(ViewMessage::Advertise { presence }),
            stamp(9, 4),
        );

        let decoded = ReliabilityMessage::decode(&msg.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, msg);
        assert_eq!(decoded.view_message().map(ViewMessage::name), Some("Advertise"));
    }

    #[test]
    fn ack_with_payload_is_rejected() {
        let host = HostId::generate();
        let data = ReliabilityMessage::data(
            host,
            vec![],
            Payload::Application(Bytes::new()),
            stamp(1, 0),
        );
        let mut ack = ReliabilityMessage::ack(host, &data, stamp(2, 0));
        ack.payload = data.payload.clone();

        let bytes = bincode::serialize(&ack).expect("serialize");
        assert!(matches!(
            ReliabilityMessage::decode(&bytes),
            Err(VsyncError::Codec(_))
        ));
    }

    #[test]
    fn deliveries_order_by_clock_then_id() {
        let early = Delivery {
            timestamp: stamp(1, 5),
            id: MessageId::generate(),
            payload: Bytes::new(),
        };
        let tie_low_process = Delivery {
            timestamp: stamp(2, 0),
            id: MessageId::generate(),
            payload: Bytes::new(),
        };
        let tie_high_process = Delivery {
            timestamp: stamp(2, 1),
            id: MessageId::generate(),
            payload: Bytes::new(),
        };

        let mut all = vec![
            tie_high_process.clone(),
            early.clone(),
            tie_low_process.clone(),
        ];
        all.sort();
        assert_eq!(all, vec![early, tie_low_process, tie_high_process]);
    }
}
