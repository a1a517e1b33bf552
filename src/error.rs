//! Error types for the file server.

use std::io;

use thiserror::Error;

use crate::server::RcbId;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the server.
#[derive(Error, Debug)]
pub enum Error {
    /// Policy name was not one of `RR`, `SJF` or `MLFB`.
    #[error("unknown scheduling policy: {0:?} (expected RR, SJF or MLFB)")]
    UnknownPolicy(String),

    /// Configuration rejected by `Config::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Request line was not of the form `GET <path> ...`.
    #[error("malformed request")]
    Malformed,

    /// Requested path does not resolve to a readable regular file.
    #[error("not found: {0}")]
    NotFound(String),

    /// The RCB table is at capacity.
    #[error("request table full ({0} in flight)")]
    TableFull(usize),

    /// The same connection already has this path in flight.
    #[error("connection {connection} already requested {path:?}")]
    Duplicate { connection: u64, path: String },

    /// The RCB is not (or no longer) in the table.
    #[error("no such request: {0}")]
    NotResident(RcbId),

    /// Sequence numbers ran out.
    #[error("request sequence numbers exhausted")]
    SequenceExhausted,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true for errors which must stop the server before it starts accepting
    /// connections. Everything else is scoped to a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownPolicy(_) | Self::InvalidConfig(_))
    }
}
