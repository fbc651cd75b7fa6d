//! Library-boundary error types.
//!
//! Pipelines and the binary entry point wrap these in `anyhow::Error` with
//! `.context(...)` the way the rest of this peer's fallible call chains do.

use thiserror::Error;

/// Errors that can occur while a peer is serving or driving the protocol.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("connection closed before opcode could be read")]
    ConnectionClosed,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("chunk {key} failed verification (expected sha1 {key}, got {actual})")]
    ChunkVerificationFailed { key: String, actual: String },

    #[error("file '{0}' is corrupted: missing chunk at index {1}")]
    CorruptedFile(String, usize),

    #[error("no peer available to serve file '{0}'")]
    NoReplicaAvailable(String),

    #[error("cluster lock denied by peer {0}")]
    LockDenied(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
