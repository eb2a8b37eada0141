//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: consumed by raft-node, which persists raft-core's HardState after every handler
//! what: Storage trait, versioned record codec, FileStorage implementation, InMemoryStorage for testing

pub mod codec;
mod error;

pub use codec::{decode_hard_state, encode_hard_state, RECORD_VERSION};
pub use error::StorageError;

use raft_core::HardState;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub type Result<T> = std::result::Result<T, StorageError>;

/// trait for durable storage of raft state
///
/// holds two blobs per node: the encoded hard state record and the latest
/// snapshot. this abstraction allows the same node code to work with:
/// - real filesystem (native)
/// - in-memory (testing)
pub trait Storage: Send {
    /// replace the hard state record, leaving the snapshot untouched
    fn save_raft_state(&mut self, state: &[u8]) -> Result<()>;

    /// replace both blobs atomically: after a crash either both or neither are visible
    fn save(&mut self, state: &[u8], snapshot: &[u8]) -> Result<()>;

    /// the hard state record, empty if none was ever saved
    fn read_raft_state(&self) -> Result<Vec<u8>>;

    /// the snapshot bytes, empty if none was ever saved
    fn read_snapshot(&self) -> Result<Vec<u8>>;

    /// size in bytes of the current hard state record
    fn raft_state_size(&self) -> u64;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> Result<()>;

    fn save_hard_state(&mut self, hard: &HardState) -> Result<()> {
        let record = encode_hard_state(hard)?;
        self.save_raft_state(&record)
    }

    fn save_hard_state_and_snapshot(&mut self, hard: &HardState, snapshot: &[u8]) -> Result<()> {
        let record = encode_hard_state(hard)?;
        self.save(&record, snapshot)
    }

    /// decode the hard state record; None for a node that never persisted
    fn load_hard_state(&self) -> Result<Option<HardState>> {
        let record = self.read_raft_state()?;
        if record.is_empty() {
            return Ok(None);
        }
        decode_hard_state(&record).map(Some)
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores one node's state under `<root>/node-<id>/` as generation-numbered files:
/// - state-<n>.json: hard state record
/// - snapshot-<n>.bin: snapshot bytes
/// - MANIFEST: names the live generations; replaced by atomic rename, so it is
///   the single commit point for a state+snapshot pair
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    manifest: Manifest,
    raft_state_size: u64,
}

/// which generation of each file is live
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Manifest {
    /// generation of the live state file, 0 if none
    state: u64,
    /// generation of the live snapshot file
    snapshot: Option<u64>,
}

impl FileStorage {
    /// open (or create) the storage of node `node_id` below `root`
    pub fn open(root: impl AsRef<Path>, node_id: u64) -> Result<Self> {
        let dir = root.as_ref().join(format!("node-{node_id}"));
        fs::create_dir_all(&dir)?;

        let manifest_path = dir.join("MANIFEST");
        let manifest = if manifest_path.exists() {
            let bytes = fs::read(&manifest_path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::CorruptManifest(e.to_string()))?
        } else {
            Manifest::default()
        };

        let mut storage = Self { dir, manifest, raft_state_size: 0 };
        if manifest.state > 0 {
            storage.raft_state_size = fs::metadata(storage.state_path(manifest.state))?.len();
        }
        Ok(storage)
    }

    /// directory holding this node's files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("state-{generation}.json"))
    }

    fn snapshot_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{generation}.bin"))
    }

    fn next_generation(&self) -> u64 {
        self.manifest.state.max(self.manifest.snapshot.unwrap_or(0)) + 1
    }

    /// atomic write: write to temp file then rename
    fn commit_manifest(&mut self, manifest: Manifest) -> io::Result<()> {
        let json = serde_json::to_vec(&manifest)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let temp_path = self.dir.join("MANIFEST.tmp");
        write_synced(&temp_path, &json)?;
        fs::rename(&temp_path, self.dir.join("MANIFEST"))?;

        let previous = std::mem::replace(&mut self.manifest, manifest);
        if previous.state > 0 && previous.state != manifest.state {
            let _ = fs::remove_file(self.state_path(previous.state));
        }
        if let Some(old) = previous.snapshot {
            if Some(old) != manifest.snapshot {
                let _ = fs::remove_file(self.snapshot_path(old));
            }
        }
        debug!(dir = %self.dir.display(), generation = manifest.state, "committed raft state");
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

impl Storage for FileStorage {
    fn save_raft_state(&mut self, state: &[u8]) -> Result<()> {
        let generation = self.next_generation();
        write_synced(&self.state_path(generation), state)?;
        self.commit_manifest(Manifest { state: generation, snapshot: self.manifest.snapshot })?;
        self.raft_state_size = state.len() as u64;
        Ok(())
    }

    fn save(&mut self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        let generation = self.next_generation();
        write_synced(&self.snapshot_path(generation), snapshot)?;
        write_synced(&self.state_path(generation), state)?;
        self.commit_manifest(Manifest { state: generation, snapshot: Some(generation) })?;
        self.raft_state_size = state.len() as u64;
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Vec<u8>> {
        if self.manifest.state == 0 {
            return Ok(Vec::new());
        }
        Ok(fs::read(self.state_path(self.manifest.state))?)
    }

    fn read_snapshot(&self) -> Result<Vec<u8>> {
        match self.manifest.snapshot {
            Some(generation) => Ok(fs::read(self.snapshot_path(generation))?),
            None => Ok(Vec::new()),
        }
    }

    fn raft_state_size(&self) -> u64 {
        self.raft_state_size
    }

    fn clear(&mut self) -> Result<()> {
        let _ = fs::remove_file(self.dir.join("MANIFEST"));
        if self.manifest.state > 0 {
            let _ = fs::remove_file(self.state_path(self.manifest.state));
        }
        if let Some(generation) = self.manifest.snapshot {
            let _ = fs::remove_file(self.snapshot_path(generation));
        }
        self.manifest = Manifest::default();
        self.raft_state_size = 0;
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Default)]
pub struct InMemoryStorage {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_raft_state(&mut self, state: &[u8]) -> Result<()> {
        self.state = state.to_vec();
        Ok(())
    }

    fn save(&mut self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        self.state = state.to_vec();
        self.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Vec<u8>> {
        Ok(self.state.clone())
    }

    fn read_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.snapshot.clone())
    }

    fn raft_state_size(&self) -> u64 {
        self.state.len() as u64
    }

    fn clear(&mut self) -> Result<()> {
        self.state.clear();
        self.snapshot.clear();
        Ok(())
    }
}
