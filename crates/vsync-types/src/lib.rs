//! # vsync-types: Core types for the vsync middleware
//!
//! This crate contains the value types shared by every layer of the stack:
//! - Identities ([`HostId`], [`MessageId`], [`ProcessId`], [`Ticket`])
//! - Logical time ([`ScalarClock`])
//! - Recovery bookkeeping ([`CheckpointId`])
//! - The identity a host announces on the wire ([`Presence`])
//!
//! None of these types perform I/O. They are cheap to copy and serialize
//! with any `serde` format.

use std::cmp::Ordering;
use std::fmt::{Debug, Display};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Host Identifier - Copy (16-byte UUID)
// ============================================================================

/// Process-unique identity of a host in the group.
///
/// Generated once per process lifetime, or restored from the recovery
/// directory when a crashed host comes back. Never reused by another live
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(Uuid);

impl HostId {
    /// Generates a fresh random host identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID (used when restoring a persisted identity).
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Eight hex digits are enough to tell hosts apart in logs.
        let simple = self.0.simple().to_string();
        write!(f, "H{}", &simple[..8])
    }
}

// ============================================================================
// Message Identifier - Copy (16-byte UUID)
// ============================================================================

/// Unique identifier of a reliability-layer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh random message ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "m{}", &simple[..8])
    }
}

// ============================================================================
// Process Identifier - Copy (4-byte value)
// ============================================================================

/// Small integer assigned to a host by the view manager on admission.
///
/// Used as the tie-breaker of [`ScalarClock`] ordering. The founding view
/// manager takes [`ProcessId::ZERO`]; every admitted host gets the next free
/// value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The process ID of the founding view manager.
    pub const ZERO: ProcessId = ProcessId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the next process ID (incremented by 1).
    pub fn next(&self) -> Self {
        ProcessId(self.0.saturating_add(1))
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ProcessId> for u32 {
    fn from(id: ProcessId) -> Self {
        id.0
    }
}

// ============================================================================
// Election Ticket - Copy (4-byte value)
// ============================================================================

/// Random tie-breaking number drawn once per host.
///
/// When the first two hosts of a group meet, the one holding the higher
/// ticket becomes the view manager and the other one dials it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket(u32);

impl Ticket {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Draws a random ticket.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ============================================================================
// Scalar Clock - Copy (Lamport timestamp)
// ============================================================================

/// Lamport timestamp `(process_id, event_id)`.
///
/// # Ordering
///
/// Primary key is `event_id` ascending; ties are broken by `process_id`
/// ascending. This gives a total order over every event in the group.
///
/// # Invariants
///
/// - Two values minted by the same process have strictly increasing
///   `event_id` in production order.
/// - A value minted after observing a remote clock is strictly greater than
///   the observed one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ScalarClock {
    process_id: ProcessId,
    event_id: u64,
}

impl ScalarClock {
    pub fn new(process_id: ProcessId, event_id: u64) -> Self {
        Self {
            process_id,
            event_id,
        }
    }

    /// Mints the clock value following the local counter `local`.
    pub fn next(process_id: ProcessId, local: u64) -> Self {
        Self::new(process_id, local.saturating_add(1))
    }

    /// Returns the new local counter after observing `received`.
    ///
    /// The result is `max(received.event_id, local) + 1`.
    pub fn merge(received: &ScalarClock, local: u64) -> u64 {
        received.event_id.max(local).saturating_add(1)
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }
}

impl Ord for ScalarClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.event_id
            .cmp(&other.event_id)
            .then_with(|| self.process_id.cmp(&other.process_id))
    }
}

impl PartialOrd for ScalarClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Debug for ScalarClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScalarClock({}.{})", self.event_id, self.process_id.0)
    }
}

impl Display for ScalarClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}.{})", self.event_id, self.process_id.0)
    }
}

// ============================================================================
// Checkpoint Identifier - Copy (8-byte value)
// ============================================================================

/// Group-wide, monotonically increasing checkpoint number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CheckpointId(u64);

impl CheckpointId {
    /// The first checkpoint a group ever takes.
    pub const ZERO: CheckpointId = CheckpointId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next checkpoint ID (incremented by 1).
    pub fn next(&self) -> Self {
        CheckpointId(self.0.saturating_add(1))
    }
}

impl Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cp#{}", self.0)
    }
}

impl From<u64> for CheckpointId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<CheckpointId> for u64 {
    fn from(id: CheckpointId) -> Self {
        id.0
    }
}

// ============================================================================
// Presence - identity announced on discovery and connection setup
// ============================================================================

/// What a host tells its peers about itself before it is part of a view.
///
/// Carried by discovery beacons and by the first frame of every connection.
/// `process_id` is only set by a host that restored a persisted identity, so
/// the view manager can hand the same process ID back on re-admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Presence {
    pub host: HostId,
    pub ticket: Ticket,
    pub process_id: Option<ProcessId>,
}

impl Presence {
    pub fn new(host: HostId, ticket: Ticket) -> Self {
        Self {
            host,
            ticket,
            process_id: None,
        }
    }

    /// Sets the restored process ID.
    pub fn with_process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }
}
