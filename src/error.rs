use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// A record decoded completely but its stored checksum does not match.
    #[error("checksum mismatch in record at offset {offset}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        offset: u64,
        stored: u32,
        computed: u32,
    },

    /// End of file reached in the middle of a record. Recoverable by truncating
    /// the file to `record_offset`.
    #[error("incomplete tail record at offset {record_offset} (file length {file_length})")]
    IncompleteTailRecord { record_offset: u64, file_length: u64 },

    /// The record framing itself is unreadable, so nothing after it can be trusted.
    #[error("corrupted log at offset {offset}: {reason}")]
    CorruptedLog { offset: u64, reason: String },

    #[error("corrupted block {block_index}: {reason}")]
    CorruptedBlock { block_index: u32, reason: String },

    #[error("invalid segment file {path:?}: {reason}")]
    InvalidSegment { path: PathBuf, reason: String },

    #[error("invalid stream header: {0}")]
    InvalidHeader(String),

    #[error("no CRC32C implementation available on this platform")]
    PlatformNotSupported,

    #[error("compression failed ({method}): {reason}")]
    Compression { method: &'static str, reason: String },

    #[error("write-ahead log {0:?} is frozen")]
    LogFrozen(PathBuf),

    #[error("segment is frozen")]
    Frozen,

    #[error("write-ahead log recovery failed for {path:?}: {reason}")]
    Recovery { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("lock error: {0}")]
    LockError(io::Error),
}

impl Error {
    /// True for errors that a reader can skip past without losing the framing.
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, Error::ChecksumMismatch { .. })
    }

    pub fn is_incomplete_tail(&self) -> bool {
        matches!(self, Error::IncompleteTailRecord { .. })
    }
}
