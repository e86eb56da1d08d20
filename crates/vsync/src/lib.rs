//! # vsync: virtual-synchrony group communication
//!
//! A dynamic set of hosts forms a group with an agreed membership (the
//! *view*), exchanges reliably acknowledged broadcasts, and delivers them to
//! the application in one total order. Crashed hosts come back through
//! checkpoints and recovery packets.
//!
//! ## Architecture
//!
//! ```text
//!   Group::send                         Group::receive_stable
//!       │                                        ▲
//!       ▼                                        │
//! ┌──────────────────────────────────────────────┴─────┐
//! │ Reliability Layer   send gate · ack tracker ·      │
//! │                     retry heap · stable queue      │──▶ Fault Recovery
//! └───────┬──────────────────────────────▲─────────────┘    (log, checkpoints)
//!         │ view messages                │ freeze / resume       ▲
//!         ▼                              │                       │
//! ┌────────────────────────────────────────────────────┐         │
//! │ View Manager        election · admission ·         │─────────┘
//! │                     failure handling · recovery    │
//! └───────┬────────────────────────────────────────────┘
//!         │ links, discovery
//!         ▼
//!   vsync_transport::Transport
//! ```
//!
//! ## Key Components
//!
//! - [`reliability`]: acknowledged broadcast, stability detection, retries
//! - [`view`]: membership views, election, admission and failure protocol
//! - [`recovery`]: message log, checkpoints and their on-disk store
//! - [`group`]: the facade wiring the layers to a transport
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vsync::{Group, GroupConfig, Identity};
//! use vsync_transport::{TcpConfig, TcpTransport};
//!
//! let config = GroupConfig::production();
//! let identity = Identity::load_or_generate(&config.recovery_dir)?;
//! let transport = TcpTransport::bind(TcpConfig::production(), identity.presence())?;
//!
//! let group = Group::start(config, identity, Arc::new(transport))?;
//! group.send(&b"hello"[..])?;
//! let next = group.receive_stable()?;
//! ```

use std::io;
use std::path::PathBuf;

use vsync_transport::{FramingError, TransportError};
use vsync_types::CheckpointId;

pub mod clock;
pub mod config;
pub mod group;
pub mod message;
pub mod recovery;
pub mod reliability;
pub mod view;

pub use clock::LamportClock;
pub use config::GroupConfig;
pub use group::Group;
pub use message::{Delivery, MessageKind, Payload, ReliabilityMessage, ViewMessage};
pub use recovery::{Checkpoint, FaultRecovery, Identity, RecoveryStore};
pub use reliability::{AckTracker, ReliabilityLayer, StableQueue, MAX_RETRIES};
pub use view::{Member, View, ViewChangeList, ViewManager, ViewStatus};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the group middleware.
#[derive(Debug, thiserror::Error)]
pub enum VsyncError {
    /// The transport refused an operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reading or writing the recovery directory failed.
    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    /// A persisted record failed its checksum or could not be decoded.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// No checkpoint with an ID at or above the requested one exists.
    #[error("no checkpoint at or after {0}")]
    CheckpointNotFound(CheckpointId),

    /// A recovery file exists but its contents are unusable.
    #[error("corrupt recovery file {path}: {reason}")]
    CorruptRecoveryFile { path: PathBuf, reason: String },

    /// The group has been shut down.
    #[error("group has been shut down")]
    ShutDown,
}

/// Result type for group operations.
pub type VsyncResult<T> = Result<T, VsyncError>;

#[cfg(test)]
mod testkit;
#[cfg(test)]
mod tests;
