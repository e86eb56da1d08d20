//! Group configuration.
//!
//! Protocol constants (retry budget, checkpoint threshold) and the local
//! resources a host needs (recovery directory, queue sizes).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::MAX_RETRIES;

/// Default number of logged messages that triggers a checkpoint.
pub const DEFAULT_LOG_THRESHOLD: usize = 100;

// ============================================================================
// Group Configuration
// ============================================================================

/// Configuration of one group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Retransmissions to a silent recipient before it is declared
    /// disconnected.
    pub max_retries: u32,

    /// Time between two retransmission rounds of an unacknowledged message.
    ///
    /// The first round fires one interval after the original send.
    pub retry_interval: Duration,

    /// Number of logged messages that triggers a group checkpoint.
    pub log_threshold: usize,

    /// Whether the view manager takes a checkpoint at the end of every
    /// admission.
    pub checkpoint_on_admission: bool,

    /// Directory holding checkpoint files, the checkpoint counter and the
    /// host identity. Created on first write.
    pub recovery_dir: PathBuf,

    /// Application payloads accepted by [`crate::Group::send`] before it
    /// blocks.
    pub send_queue_capacity: usize,

    /// Number of completed message IDs remembered for duplicate
    /// suppression.
    pub recent_messages: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl GroupConfig {
    /// Settings for a deployed group.
    pub fn production() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_interval: Duration::from_secs(10),
            log_threshold: DEFAULT_LOG_THRESHOLD,
            checkpoint_on_admission: true,
            recovery_dir: PathBuf::from("recovery"),
            send_queue_capacity: 256,
            recent_messages: 4096,
        }
    }

    /// Short retry rounds for local experiments.
    pub fn development() -> Self {
        Self {
            retry_interval: Duration::from_millis(500),
            ..Self::production()
        }
    }

    /// Fast settings for multi-host tests in one process.
    pub fn testing(recovery_dir: impl AsRef<Path>) -> Self {
        Self {
            retry_interval: Duration::from_millis(50),
            recovery_dir: recovery_dir.as_ref().to_path_buf(),
            send_queue_capacity: 64,
            recent_messages: 1024,
            ..Self::production()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_log_threshold(mut self, threshold: usize) -> Self {
        debug_assert!(threshold > 0, "log threshold must be positive");
        self.log_threshold = threshold;
        self
    }

    pub fn with_checkpoint_on_admission(mut self, enabled: bool) -> Self {
        self.checkpoint_on_admission = enabled;
        self
    }

    pub fn with_recovery_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.recovery_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_recent_messages(mut self, count: usize) -> Self {
        self.recent_messages = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_matches_protocol_constants() {
        let config = GroupConfig::production();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.log_threshold, 100);
        assert_eq!(config.retry_interval, Duration::from_secs(10));
        assert!(config.checkpoint_on_admission);
    }

    #[test]
    fn builders_override_presets() {
        let config = GroupConfig::testing("/tmp/vsync-a")
            .with_log_threshold(5)
            .with_checkpoint_on_admission(false)
            .with_retry_interval(Duration::from_millis(10));

        assert_eq!(config.log_threshold, 5);
        assert!(!config.checkpoint_on_admission);
        assert_eq!(config.retry_interval, Duration::from_millis(10));
        assert_eq!(config.recovery_dir, PathBuf::from("/tmp/vsync-a"));
        assert_eq!(config.max_retries, MAX_RETRIES);
    }
}
