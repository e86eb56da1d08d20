//! On-disk layout of the recovery directory.
//!
//! ```text
//! <recovery_dir>/
//!   Checkpoint0.bin      framed Delivery records, clock order
//!   Checkpoint1.bin
//!   ...
//!   checkpoint.counter   one framed u64: the next checkpoint ID
//!   identity.bin         one framed Identity
//! ```
//!
//! Every record is `[len u32 BE][crc32 u32 BE][bincode body]`, the same
//! framing the TCP transport uses. Files are written to a temporary sibling,
//! synced and renamed into place, so a crash never leaves a torn file under
//! the final name.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::debug;
use vsync_transport::{FrameDecoder, FrameEncoder};
use vsync_types::CheckpointId;

use super::{Checkpoint, Identity};
use crate::message::Delivery;
use crate::{VsyncError, VsyncResult};

const CHECKPOINT_PREFIX: &str = "Checkpoint";
const CHECKPOINT_EXTENSION: &str = "bin";
const COUNTER_FILE: &str = "checkpoint.counter";
const IDENTITY_FILE: &str = "identity.bin";

/// Reads and writes the recovery directory. The directory is created on the
/// first write.
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    dir: PathBuf,
    encoder: FrameEncoder,
}

impl RecoveryStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            encoder: FrameEncoder::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self, id: CheckpointId) -> PathBuf {
        self.dir.join(format!(
            "{CHECKPOINT_PREFIX}{}.{CHECKPOINT_EXTENSION}",
            id.as_u64()
        ))
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> VsyncResult<()> {
        let mut contents = Vec::new();
        for entry in &checkpoint.entries {
            self.encoder.encode_to(entry, &mut contents)?;
        }
        self.write_atomically(&self.checkpoint_path(checkpoint.id), &contents)?;
        debug!(
            checkpoint = %checkpoint.id,
            entries = checkpoint.entries.len(),
            "checkpoint persisted"
        );
        Ok(())
    }

    /// Loads every checkpoint file, ordered by ID.
    ///
    /// A missing directory means no checkpoints.
    pub fn load_checkpoints(&self) -> VsyncResult<Vec<Checkpoint>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(id) = parse_checkpoint_name(&path) else {
                continue;
            };
            let entries: Vec<Delivery> = self.read_records(&path)?;
            checkpoints.push(Checkpoint { id, entries });
        }
        checkpoints.sort_by_key(|c| c.id);
        Ok(checkpoints)
    }

    // ------------------------------------------------------------------------
    // Counter and identity
    // ------------------------------------------------------------------------

    /// The persisted next checkpoint ID, if any.
    pub fn read_counter(&self) -> VsyncResult<Option<CheckpointId>> {
        let counter: Option<u64> = self.read_single(&self.dir.join(COUNTER_FILE))?;
        Ok(counter.map(CheckpointId::new))
    }

    pub fn write_counter(&self, next: CheckpointId) -> VsyncResult<()> {
        let frame = self.encoder.encode(&next.as_u64())?;
        self.write_atomically(&self.dir.join(COUNTER_FILE), &frame)
    }

    pub fn read_identity(&self) -> VsyncResult<Option<Identity>> {
        self.read_single(&self.dir.join(IDENTITY_FILE))
    }

    pub fn write_identity(&self, identity: &Identity) -> VsyncResult<()> {
        let frame = self.encoder.encode(identity)?;
        self.write_atomically(&self.dir.join(IDENTITY_FILE), &frame)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn read_records<T: DeserializeOwned>(&self, path: &Path) -> VsyncResult<Vec<T>> {
        let mut file = File::open(path)?;
        FrameDecoder::new()
            .read_all(&mut file)
            .map_err(|e| VsyncError::CorruptRecoveryFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn read_single<T: DeserializeOwned>(&self, path: &Path) -> VsyncResult<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut records: Vec<T> = self.read_records(path)?;
        match records.len() {
            1 => Ok(records.pop()),
            n => Err(VsyncError::CorruptRecoveryFile {
                path: path.to_path_buf(),
                reason: format!("expected one record, found {n}"),
            }),
        }
    }

    fn write_atomically(&self, path: &Path, contents: &[u8]) -> VsyncResult<()> {
        fs::create_dir_all(&self.dir)?;

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn parse_checkpoint_name(path: &Path) -> Option<CheckpointId> {
    if path.extension()? != CHECKPOINT_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse::<u64>()
        .ok()
        .map(CheckpointId::new)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;
    use vsync_types::{MessageId, ProcessId, ScalarClock};

    use super::*;

    fn delivery(event: u64, body: &'static [u8]) -> Delivery {
        Delivery {
            timestamp: ScalarClock::new(ProcessId::ZERO, event),
            id: MessageId::generate(),
            payload: Bytes::from_static(body),
        }
    }

    #[test]
    fn missing_directory_reads_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        let store = RecoveryStore::new(dir.path().join("absent"));

        assert!(store.load_checkpoints().expect("load").is_empty());
        assert_eq!(store.read_counter().expect("counter"), None);
        assert!(store.read_identity().expect("identity").is_none());
    }

    #[test]
    fn checkpoints_reload_in_id_order() {
        let dir = TempDir::new().expect("tempdir");
        let store = RecoveryStore::new(dir.path().join("recovery"));

        let second = Checkpoint {
            id: CheckpointId::new(10),
            entries: vec![delivery(5, b"c")],
        };
        let first = Checkpoint {
            id: CheckpointId::new(2),
            entries: vec![delivery(1, b"a"), delivery(2, b"b")],
        };
        store.write_checkpoint(&second).expect("write");
        store.write_checkpoint(&first).expect("write");

        let loaded = store.load_checkpoints().expect("load");
        assert_eq!(loaded, vec![first, second]);
        assert!(store.checkpoint_path(CheckpointId::new(2)).ends_with("Checkpoint2.bin"));
    }

    #[test]
    fn counter_overwrites_previous_value() {
        let dir = TempDir::new().expect("tempdir");
        let store = RecoveryStore::new(dir.path());

        store.write_counter(CheckpointId::new(3)).expect("write");
        store.write_counter(CheckpointId::new(4)).expect("write");

        assert_eq!(store.read_counter().expect("read"), Some(CheckpointId::new(4)));
    }

    #[test]
    fn truncated_checkpoint_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let store = RecoveryStore::new(dir.path());
        let checkpoint = Checkpoint {
            id: CheckpointId::ZERO,
            entries: vec![delivery(1, b"payload")],
        };
        store.write_checkpoint(&checkpoint).expect("write");

        let path = store.checkpoint_path(CheckpointId::ZERO);
        let bytes = fs::read(&path).expect("read");
        fs::write(&path, &bytes[..bytes.len() - 2]).expect("truncate");

        assert!(matches!(
            store.load_checkpoints(),
            Err(VsyncError::CorruptRecoveryFile { .. })
        ));
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("notes.txt"), b"hi").expect("write");
        fs::write(dir.path().join("CheckpointX.bin"), b"junk").expect("write");

        let store = RecoveryStore::new(dir.path());
        assert!(store.load_checkpoints().expect("load").is_empty());
    }
}
