use std::io;
use thiserror::Error;

/// errors surfaced by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unsupported record version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),
}
