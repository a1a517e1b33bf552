//! Request-line parsing and the status lines sent in reply.

use crate::error::{Error, Result};

pub const STATUS_OK: &[u8] = b"HTTP/1.1 200 OK\n\n";
pub const STATUS_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad request\n\n";
pub const STATUS_NOT_FOUND: &[u8] = b"HTTP/1.1 404 File not found\n\n";
pub const STATUS_BUSY: &[u8] = b"HTTP/1.1 503 Server busy\n\n";

/// Extracts the path from a request of the form `GET <path> ...`. Only the first line is
/// considered; any other verb, or a missing path, is malformed.
pub fn parse_request_line(bytes: &[u8]) -> Result<&str> {
    let line = bytes
        .split(|&b| b == b'\n')
        .next()
        .ok_or(Error::Malformed)?;

    let line = std::str::from_utf8(line).map_err(|_| Error::Malformed)?;

    let mut tokens = line.split_ascii_whitespace();

    match (tokens.next(), tokens.next()) {
        (Some("GET"), Some(path)) => Ok(path),
        _ => Err(Error::Malformed),
    }
}

/// Status line to send for a request that could not be admitted.
pub fn rejection_status(err: &Error) -> &'static [u8] {
    match err {
        Error::Malformed => STATUS_BAD_REQUEST,
        Error::NotFound(_) => STATUS_NOT_FOUND,
        Error::TableFull(_) | Error::SequenceExhausted => STATUS_BUSY,
        _ => STATUS_BAD_REQUEST,
    }
}
