//! The identity a host keeps across restarts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vsync_types::{HostId, Presence, ProcessId, Ticket};

use super::RecoveryStore;
use crate::VsyncResult;

/// Host ID, assigned process ID and election ticket.
///
/// Persisted once the host is admitted. A host that finds a persisted
/// identity on startup comes back as the same host and asks to recover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub host: HostId,
    pub process_id: Option<ProcessId>,
    pub ticket: Ticket,
    #[serde(skip)]
    restored: bool,
}

impl Identity {
    /// A fresh identity with a random ticket.
    pub fn generate() -> Self {
        Self {
            host: HostId::generate(),
            process_id: None,
            ticket: Ticket::random(),
            restored: false,
        }
    }

    /// Restores the identity persisted in `dir`, or generates a fresh one.
    ///
    /// An unreadable identity file is treated as absent.
    pub fn load_or_generate(dir: impl AsRef<Path>) -> VsyncResult<Self> {
        let store = RecoveryStore::new(dir);
        match store.read_identity() {
            Ok(Some(mut identity)) => {
                identity.restored = true;
                info!(host = %identity.host, process = ?identity.process_id, "identity restored");
                Ok(identity)
            }
            Ok(None) => Ok(Self::generate()),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable identity file");
                Ok(Self::generate())
            }
        }
    }

    pub fn with_ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = ticket;
        self
    }

    /// True if this identity was loaded from disk.
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// What the host announces to its peers.
    pub fn presence(&self) -> Presence {
        let presence = Presence::new(self.host, self.ticket);
        match self.process_id {
            Some(process_id) => presence.with_process_id(process_id),
            None => presence,
        }
    }
}
