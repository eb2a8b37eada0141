//! # codec
//!
//! why: give the persisted hard state a stable, versioned record format
//! relations: used by the Storage trait's typed helpers, read back on node restart
//! what: encode_hard_state / decode_hard_state over a serde_json envelope

use crate::{Result, StorageError};
use raft_core::HardState;
use serde::{Deserialize, Serialize};

/// bumped whenever the HardState layout changes incompatibly
pub const RECORD_VERSION: u32 = 1;

#[derive(Serialize)]
struct RecordRef<'a> {
    version: u32,
    hard_state: &'a HardState,
}

#[derive(Deserialize)]
struct Record {
    version: u32,
    hard_state: HardState,
}

pub fn encode_hard_state(hard: &HardState) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&RecordRef { version: RECORD_VERSION, hard_state: hard })?)
}

pub fn decode_hard_state(bytes: &[u8]) -> Result<HardState> {
    let record: Record = serde_json::from_slice(bytes)?;
    if record.version != RECORD_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: record.version,
            expected: RECORD_VERSION,
        });
    }
    Ok(record.hard_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_version_is_refused() {
        let bytes = br#"{"version":2,"hard_state":{"current_term":1,"voted_for":null,"last_snapshot_include_index":0,"last_snapshot_include_term":0,"logs":[]}}"#;
        let err = decode_hard_state(bytes).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedVersion { found: 2, expected: 1 }));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(decode_hard_state(b"not json"), Err(StorageError::Codec(_))));
    }
}
