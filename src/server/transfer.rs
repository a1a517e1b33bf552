use std::io;

use crate::request::STATUS_OK;

use super::table::Rcb;

/// Result of one round for one request.
#[derive(Debug)]
pub enum Outcome {
    /// Every byte has been written.
    Completed,
    /// Bytes remain for a later round.
    Pending,
    /// The transfer cannot continue; the request must be evicted.
    Failed(io::Error),
}

#[derive(Debug)]
pub struct Round {
    // Body bytes confirmed written this round
    pub written: u64,
    pub outcome: Outcome,
}

impl Outcome {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Writes all of `chunk`, retrying short writes. Returns how many bytes were accepted alongside
/// the result, so a failure part way through still accounts for what went out.
fn write_chunk<W: io::Write>(writer: &mut W, mut chunk: &[u8]) -> (usize, io::Result<()>) {
    let mut confirmed = 0;

    while !chunk.is_empty() {
        match writer.write(chunk) {
            Ok(0) => {
                return (
                    confirmed,
                    Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection accepted no bytes",
                    )),
                );
            }
            Ok(n) => {
                confirmed += n;
                chunk = &chunk[n..];
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
            // A write timeout surfaces as WouldBlock / TimedOut: the client has stalled
            Err(err) => return (confirmed, Err(err)),
        }
    }

    (confirmed, Ok(()))
}

fn read_some<R: io::Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
            result => return result,
        }
    }
}

/// Sends a status line, retrying short writes.
pub fn send_status<W: io::Write>(writer: &mut W, status: &[u8]) -> io::Result<()> {
    write_chunk(writer, status).1?;
    writer.flush()
}

/// Moves up to `rcb.quantum` bytes from the request's stream to its connection, staging them
/// through `buffer`. The 200 status line precedes the first body byte.
pub fn run_round<C, S>(rcb: &mut Rcb<C, S>, buffer: &mut [u8]) -> Round
where
    C: io::Write,
    S: io::Read,
{
    debug_assert!(!buffer.is_empty());

    let failed = |written, err| Round {
        written,
        outcome: Outcome::Failed(err),
    };

    let quantum = match rcb.quantum {
        Some(quantum) if quantum > 0 => quantum,
        _ => {
            return failed(
                0,
                io::Error::new(io::ErrorKind::InvalidInput, "no quantum assigned"),
            )
        }
    };

    if !rcb.status_sent {
        if let Err(err) = send_status(&mut rcb.connection, STATUS_OK) {
            return failed(0, err);
        }
        rcb.status_sent = true;
    }

    let mut written = 0u64;

    while written < quantum && rcb.bytes_remaining > 0 {
        let want = (quantum - written)
            .min(rcb.bytes_remaining)
            .min(buffer.len() as u64) as usize;

        let n = match read_some(&mut rcb.stream, &mut buffer[..want]) {
            Ok(0) => {
                return failed(
                    written,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "resource ended before its reported size",
                    ),
                );
            }
            Ok(n) => n,
            Err(err) => return failed(written, err),
        };

        let (confirmed, result) = write_chunk(&mut rcb.connection, &buffer[..n]);

        written += confirmed as u64;
        rcb.bytes_remaining -= confirmed as u64;

        if let Err(err) = result {
            return failed(written, err);
        }
    }

    if let Err(err) = rcb.connection.flush() {
        return failed(written, err);
    }

    let outcome = if rcb.bytes_remaining == 0 {
        Outcome::Completed
    } else {
        Outcome::Pending
    };

    Round { written, outcome }
}
