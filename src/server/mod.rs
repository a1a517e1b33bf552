mod table;
mod transfer;

use std::io;
use std::net;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time;

use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::policy::{self, Policy, Quanta};
use crate::request;
use crate::resolve::{Resolve, Resolver};
use crate::transport::{Connection, TcpTransport, Transport};

pub use table::{Rcb, RcbId, RcbTable, Rejected};
pub use transfer::{Outcome, Round};

const RCB_COUNT_MAX_DEFAULT: usize = 64;
const RCB_COUNT_MAX_MAX: usize = 65536;

const CHUNK_SIZE_DEFAULT: usize = 8192;

const REQUEST_SIZE_MAX_DEFAULT: usize = 8192;
const REQUEST_SIZE_MAX_MIN: usize = 16;

const REQUEST_TIMEOUT_DEFAULT_MS: u64 = 10_000;
const WRITE_TIMEOUT_DEFAULT_MS: u64 = 5_000;
const IDLE_WAIT_DEFAULT_MS: u64 = 250;

/// Configuration for a [`Server`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Ordering and slicing policy.
    ///
    /// Default value: round robin
    pub policy: Policy,

    /// Quantum sizes used by the policy.
    pub quanta: Quanta,

    /// Directory that request paths are resolved against.
    ///
    /// Default value: `.`
    pub root: PathBuf,

    /// Maximum number of requests in flight at any given time. Requests beyond this are refused
    /// with a busy status.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 65,536 \
    /// Default value: 64
    pub rcb_count_max: usize,

    /// Size of the staging buffer between file and socket, in bytes.
    ///
    /// Minimum value: 1 \
    /// Default value: 8,192
    pub chunk_size: usize,

    /// Number of request bytes read when a connection is admitted.
    ///
    /// Minimum value: 16 \
    /// Default value: 8,192
    pub request_size_max: usize,

    /// Time a connection may stay open without sending its request, in milliseconds. Silent
    /// connections are closed once it passes.
    ///
    /// Minimum value: 1 \
    /// Default value: 10,000
    pub request_timeout_ms: u64,

    /// Time a write may make no progress before the transfer is failed, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 5,000
    pub write_timeout_ms: u64,

    /// Longest wait for new connections while idle, in milliseconds. Bounds how long a shutdown
    /// request may go unnoticed.
    ///
    /// Minimum value: 1 \
    /// Default value: 250
    pub idle_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            quanta: Quanta::default(),
            root: PathBuf::from("."),
            rcb_count_max: RCB_COUNT_MAX_DEFAULT,
            chunk_size: CHUNK_SIZE_DEFAULT,
            request_size_max: REQUEST_SIZE_MAX_DEFAULT,
            request_timeout_ms: REQUEST_TIMEOUT_DEFAULT_MS,
            write_timeout_ms: WRITE_TIMEOUT_DEFAULT_MS,
            idle_wait_ms: IDLE_WAIT_DEFAULT_MS,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.rcb_count_max == 0 {
            return invalid("rcb_count_max == 0".into());
        }
        if self.rcb_count_max > RCB_COUNT_MAX_MAX {
            return invalid(format!("rcb_count_max > {}", RCB_COUNT_MAX_MAX));
        }
        if self.chunk_size == 0 {
            return invalid("chunk_size == 0".into());
        }
        if self.request_size_max < REQUEST_SIZE_MAX_MIN {
            return invalid(format!("request_size_max < {}", REQUEST_SIZE_MAX_MIN));
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms == 0".into());
        }
        if self.write_timeout_ms == 0 {
            return invalid("write_timeout_ms == 0".into());
        }
        if self.idle_wait_ms == 0 {
            return invalid("idle_wait_ms == 0".into());
        }

        self.quanta.validate()
    }
}

/// Where the scheduling loop is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No requests in flight; waiting for arrivals.
    Idle,
    /// Draining ready connections into the table.
    Admitting,
    /// A plan exists for the current table.
    Scheduled,
    /// Transfers are executing in planned order.
    Running,
    /// Finished and failed requests are being evicted.
    Reaping,
}

/// One planned turn and what came of it.
#[derive(Debug)]
pub struct Turn {
    pub id: RcbId,
    pub quantum: u64,
    pub written: u64,
    pub outcome: Outcome,
}

/// Everything that happened in one pass of the scheduling loop.
#[derive(Debug, Default)]
pub struct RoundReport {
    /// Requests admitted at the start of the pass.
    pub admitted: Vec<RcbId>,
    /// Connections turned away with an error status.
    pub rejected: usize,
    /// Turns in the order they ran.
    pub turns: Vec<Turn>,
}

impl RoundReport {
    pub fn order(&self) -> Vec<RcbId> {
        self.turns.iter().map(|turn| turn.id).collect()
    }

    pub fn completed(&self) -> Vec<RcbId> {
        self.turns
            .iter()
            .filter(|turn| matches!(turn.outcome, Outcome::Completed))
            .map(|turn| turn.id)
            .collect()
    }

    pub fn failed(&self) -> Vec<RcbId> {
        self.turns
            .iter()
            .filter(|turn| matches!(turn.outcome, Outcome::Failed(_)))
            .map(|turn| turn.id)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.rejected == 0 && self.turns.is_empty()
    }
}

/// A scheduling file server.
pub struct Server<T, R>
where
    T: Transport,
    R: Resolve,
{
    // Saved configuration
    config: Config,
    // Source of client connections
    transport: T,
    // Maps request paths onto streams
    resolver: R,
    // Requests in flight
    table: RcbTable<T::Connection, R::Stream>,
    // Current loop state
    state: State,
    // Always-allocated staging buffer for file data
    chunk_buffer: Box<[u8]>,
    // Always-allocated request buffer
    request_buffer: Box<[u8]>,
}

impl Server<TcpTransport, Resolver> {
    /// Validates `config` and binds a TCP listener serving files from `config.root`.
    pub fn bind<A>(bind_addr: A, config: Config) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate()?;

        if !config.root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "root {:?} is not a directory",
                config.root
            )));
        }

        let request_timeout = time::Duration::from_millis(config.request_timeout_ms);
        let write_timeout = time::Duration::from_millis(config.write_timeout_ms);

        let transport = TcpTransport::bind(bind_addr, Some(request_timeout), Some(write_timeout))?;
        let resolver = Resolver::new(config.root.clone());

        Self::with_transport(config, transport, resolver)
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.transport.local_addr()
    }
}

impl<T, R> Server<T, R>
where
    T: Transport,
    R: Resolve,
{
    pub fn with_transport(config: Config, transport: T, resolver: R) -> Result<Self> {
        config.validate()?;

        info!(
            policy = %config.policy,
            "{} scheduler selected",
            config.policy.description()
        );

        Ok(Self {
            table: RcbTable::new(config.rcb_count_max),
            chunk_buffer: vec![0; config.chunk_size].into_boxed_slice(),
            request_buffer: vec![0; config.request_size_max].into_boxed_slice(),
            state: State::Idle,
            config,
            transport,
            resolver,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn table(&self) -> &RcbTable<T::Connection, R::Stream> {
        &self.table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Runs the loop until `shutdown` is set, then closes any connections still in flight. Transport
    /// errors are logged and the loop carries on.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let idle_wait = time::Duration::from_millis(self.config.idle_wait_ms);

        while !shutdown.load(Ordering::Relaxed) {
            if self.table.is_empty() {
                self.state = State::Idle;

                if let Err(err) = self.transport.await_arrivals(Some(idle_wait)) {
                    warn!(error = %err, "failed to wait for connections");
                    thread::sleep(idle_wait);
                }
            }

            self.step();
        }

        self.abort_all();

        Ok(())
    }

    /// Performs one pass: admits ready connections, plans the table, runs one turn per planned
    /// request, and evicts whatever finished or failed. Never blocks waiting for arrivals.
    pub fn step(&mut self) -> RoundReport {
        let mut report = RoundReport::default();

        self.state = State::Admitting;
        self.admit_ready(&mut report);

        if self.table.is_empty() {
            self.state = State::Idle;
            return report;
        }

        let plan = policy::plan(self.config.policy, &self.config.quanta, &self.table.snapshot());
        self.state = State::Scheduled;

        for rcb in self.table.iter() {
            trace!(
                id = %rcb.id(),
                path = rcb.path(),
                bytes_remaining = rcb.bytes_remaining(),
                feedback_level = rcb.feedback_level(),
                "in flight"
            );
        }

        self.state = State::Running;

        for slot in plan {
            let Some(rcb) = self.table.get_mut(slot.id) else {
                continue;
            };

            rcb.quantum = Some(slot.quantum);

            let round = transfer::run_round(rcb, &mut self.chunk_buffer);

            if self
                .config
                .policy
                .demotes(slot.quantum, round.written, rcb.bytes_remaining)
            {
                rcb.feedback_level += 1;
            }

            trace!(
                id = %slot.id,
                quantum = slot.quantum,
                written = round.written,
                outcome = ?round.outcome,
                "turn"
            );

            report.turns.push(Turn {
                id: slot.id,
                quantum: slot.quantum,
                written: round.written,
                outcome: round.outcome,
            });
        }

        self.state = State::Reaping;
        self.reap(&report.turns);

        self.state = if self.table.is_empty() {
            State::Idle
        } else {
            State::Scheduled
        };

        report
    }

    fn admit_ready(&mut self, report: &mut RoundReport) {
        loop {
            let connection = match self.transport.accept_ready() {
                Ok(Some(connection)) => connection,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    break;
                }
            };

            match self.admit(connection) {
                Some(id) => report.admitted.push(id),
                None => report.rejected += 1,
            }
        }
    }

    /// Reads and parses a request, then tries to place it in the table. Refused connections are
    /// answered and closed here.
    fn admit(&mut self, mut connection: T::Connection) -> Option<RcbId> {
        let connection_id = connection.id();

        let len = match read_request(&mut connection, &mut self.request_buffer) {
            Ok(len) => len,
            Err(err) => {
                debug!(connection = connection_id, error = %err, "failed to read request");
                self.transport.close(connection);
                return None;
            }
        };

        let path = match request::parse_request_line(&self.request_buffer[..len]) {
            Ok(path) => path,
            Err(err) => {
                self.reject(connection, err);
                return None;
            }
        };

        match self.table.admit(connection, path, &self.resolver) {
            Ok(id) => {
                debug!(
                    id = %id,
                    connection = connection_id,
                    path,
                    size = self.table.get(id).map(|rcb| rcb.size()),
                    "admitted"
                );
                Some(id)
            }
            Err(Rejected { connection, error }) => {
                self.reject(connection, error);
                None
            }
        }
    }

    fn reject(&mut self, mut connection: T::Connection, error: Error) {
        let status = request::rejection_status(&error);

        info!(connection = connection.id(), %error, "request refused");

        if let Err(err) = transfer::send_status(&mut connection, status) {
            debug!(connection = connection.id(), error = %err, "failed to send status");
        }

        self.transport.close(connection);
    }

    fn reap(&mut self, turns: &[Turn]) {
        for turn in turns.iter().filter(|turn| turn.outcome.is_finished()) {
            match &turn.outcome {
                Outcome::Failed(err) => warn!(id = %turn.id, error = %err, "transfer failed"),
                _ => debug!(id = %turn.id, "transfer complete"),
            }

            match self.table.evict(turn.id) {
                Ok(connection) => self.transport.close(connection),
                Err(err) => warn!(error = %err, "eviction failed"),
            }
        }
    }

    fn abort_all(&mut self) {
        for id in self.table.ids() {
            if let Ok(connection) = self.table.evict(id) {
                debug!(id = %id, "closing unfinished transfer");
                self.transport.close(connection);
            }
        }

        self.state = State::Idle;
    }
}

fn read_request<C: Connection>(connection: &mut C, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match connection.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
            result => return result,
        }
    }
}
