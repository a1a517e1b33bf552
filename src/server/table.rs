use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::policy::Candidate;
use crate::resolve::Resolve;
use crate::transport::Connection;

/// Request sequence number. Assigned at admission, starting at 1, and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RcbId(pub(crate) u64);

impl RcbId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RcbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request control block: the state of one in-flight transfer.
pub struct Rcb<C, S> {
    pub(super) id: RcbId,
    // Client endpoint, handed back to the transport on eviction
    pub(super) connection: C,
    // Path as requested
    pub(super) path: String,
    // Positioned at the next unsent byte
    pub(super) stream: S,
    // Total resource size
    pub(super) size: u64,
    // Bytes not yet confirmed written to the connection
    pub(super) bytes_remaining: u64,
    // Slice for the next round, set by the planner
    pub(super) quantum: Option<u64>,
    // Multilevel feedback queue index
    pub(super) feedback_level: u32,
    // Whether the 200 status line has gone out
    pub(super) status_sent: bool,
}

impl<C, S> Rcb<C, S> {
    pub fn id(&self) -> RcbId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    pub fn quantum(&self) -> Option<u64> {
        self.quantum
    }

    pub fn feedback_level(&self) -> u32 {
        self.feedback_level
    }

    fn candidate(&self) -> Candidate {
        Candidate {
            id: self.id,
            bytes_remaining: self.bytes_remaining,
            feedback_level: self.feedback_level,
        }
    }
}

impl<C, S> fmt::Debug for Rcb<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rcb")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("bytes_remaining", &self.bytes_remaining)
            .field("quantum", &self.quantum)
            .field("feedback_level", &self.feedback_level)
            .finish()
    }
}

/// A refused admission. The connection comes back so the caller can reply and close it.
pub struct Rejected<C> {
    pub connection: C,
    pub error: Error,
}

/// Bounded set of in-flight requests.
pub struct RcbTable<C, S> {
    // Keyed by id; iteration order is not a scheduling order
    rcbs: BTreeMap<RcbId, Rcb<C, S>>,
    // (connection id, path) of every resident RCB
    in_flight: HashSet<(u64, String)>,
    capacity: usize,
    next_seq: u64,
}

impl<C, S> RcbTable<C, S>
where
    C: Connection,
{
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);

        Self {
            rcbs: BTreeMap::new(),
            in_flight: HashSet::new(),
            capacity,
            next_seq: 1,
        }
    }

    /// Resolves `path` and inserts a new RCB for it.
    pub fn admit<R>(
        &mut self,
        connection: C,
        path: &str,
        resolver: &R,
    ) -> std::result::Result<RcbId, Rejected<C>>
    where
        R: Resolve<Stream = S>,
    {
        match self.try_admit(&connection, path, resolver) {
            Ok((id, resource)) => {
                self.in_flight.insert((connection.id(), path.to_string()));
                self.next_seq += 1;

                self.rcbs.insert(
                    id,
                    Rcb {
                        id,
                        connection,
                        path: path.to_string(),
                        stream: resource.stream,
                        size: resource.size,
                        bytes_remaining: resource.size,
                        quantum: None,
                        feedback_level: 0,
                        status_sent: false,
                    },
                );

                Ok(id)
            }
            Err(error) => Err(Rejected { connection, error }),
        }
    }

    fn try_admit<R>(
        &self,
        connection: &C,
        path: &str,
        resolver: &R,
    ) -> Result<(RcbId, crate::resolve::Resource<S>)>
    where
        R: Resolve<Stream = S>,
    {
        if self.rcbs.len() >= self.capacity {
            return Err(Error::TableFull(self.rcbs.len()));
        }

        if self
            .in_flight
            .contains(&(connection.id(), path.to_string()))
        {
            return Err(Error::Duplicate {
                connection: connection.id(),
                path: path.to_string(),
            });
        }

        // The counter must still have room to advance past this id
        if self.next_seq == u64::MAX {
            return Err(Error::SequenceExhausted);
        }

        let resource = resolver.resolve(path)?;

        Ok((RcbId(self.next_seq), resource))
    }

    /// Removes an RCB, closing its stream, and returns its connection. Fails if the RCB has
    /// already been evicted.
    pub fn evict(&mut self, id: RcbId) -> Result<C> {
        let rcb = self.rcbs.remove(&id).ok_or(Error::NotResident(id))?;

        self.in_flight.remove(&(rcb.connection.id(), rcb.path));

        Ok(rcb.connection)
    }

    /// Current membership, in no particular order.
    pub fn snapshot(&self) -> Vec<Candidate> {
        self.rcbs.values().map(Rcb::candidate).collect()
    }

    pub fn get(&self, id: RcbId) -> Option<&Rcb<C, S>> {
        self.rcbs.get(&id)
    }

    pub fn get_mut(&mut self, id: RcbId) -> Option<&mut Rcb<C, S>> {
        self.rcbs.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<RcbId> {
        self.rcbs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rcb<C, S>> {
        self.rcbs.values()
    }

    pub fn len(&self) -> usize {
        self.rcbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rcbs.is_empty()
    }
}
