use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use sws::error::{Error, Result};
use sws::policy::{Policy, Quanta};
use sws::request::STATUS_OK;
use sws::resolve::{Resolve, Resource};
use sws::server::{Config, Server};
use sws::transport::{Connection, Transport};

pub struct MockConnection {
    pub id: u64,
    // Bytes the client sent
    pub request: Vec<u8>,
    request_read: bool,
    // Bytes the server wrote
    pub received: Vec<u8>,
    // Most bytes accepted by a single write call
    pub accept_max: usize,
    // Total bytes accepted before every write fails
    pub fail_after: Option<usize>,
}

impl MockConnection {
    pub fn new(id: u64, request: &[u8]) -> Self {
        Self {
            id,
            request: request.to_vec(),
            request_read: false,
            received: Vec::new(),
            accept_max: usize::MAX,
            fail_after: None,
        }
    }

    pub fn get(id: u64, path: &str) -> Self {
        Self::new(id, format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes())
    }

    /// Body following a 200 status line.
    pub fn body(&self) -> &[u8] {
        assert!(
            self.received.starts_with(STATUS_OK),
            "connection {} got {:?}",
            self.id,
            String::from_utf8_lossy(&self.received[..self.received.len().min(40)])
        );
        &self.received[STATUS_OK.len()..]
    }
}

impl io::Read for MockConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.request_read {
            return Ok(0);
        }
        self.request_read = true;

        let n = self.request.len().min(buf.len());
        buf[..n].copy_from_slice(&self.request[..n]);

        Ok(n)
    }
}

impl io::Write for MockConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut n = buf.len().min(self.accept_max);

        if let Some(limit) = self.fail_after {
            let room = limit.saturating_sub(self.received.len());
            if room == 0 {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            n = n.min(room);
        }

        self.received.extend_from_slice(&buf[..n]);

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
pub struct MockTransport {
    pub incoming: VecDeque<MockConnection>,
    pub closed: Vec<MockConnection>,
    pub waits: usize,
    // Number of upcoming waits which fail
    pub wait_failures: usize,
    // Flag raised once this many waits have happened
    pub stop_after_waits: Option<(usize, Arc<AtomicBool>)>,
}

impl MockTransport {
    pub fn push(&mut self, connection: MockConnection) {
        self.incoming.push_back(connection);
    }

    pub fn closed(&self, id: u64) -> &MockConnection {
        self.closed
            .iter()
            .find(|c| c.id == id)
            .unwrap_or_else(|| panic!("connection {id} not closed"))
    }

    pub fn is_closed(&self, id: u64) -> bool {
        self.closed.iter().any(|c| c.id == id)
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    fn accept_ready(&mut self) -> io::Result<Option<MockConnection>> {
        Ok(self.incoming.pop_front())
    }

    fn await_arrivals(&mut self, _timeout: Option<time::Duration>) -> io::Result<()> {
        self.waits += 1;

        if let Some((waits, shutdown)) = &self.stop_after_waits {
            if self.waits >= *waits {
                shutdown.store(true, Ordering::Relaxed);
            }
        }

        if self.wait_failures > 0 {
            self.wait_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
        }

        Ok(())
    }

    fn close(&mut self, connection: MockConnection) {
        assert!(
            !self.is_closed(connection.id),
            "connection {} closed twice",
            connection.id
        );
        self.closed.push(connection);
    }
}

#[derive(Default)]
pub struct MockResolver {
    pub files: HashMap<String, Vec<u8>>,
}

impl MockResolver {
    pub fn add(&mut self, path: &str, content: Vec<u8>) {
        self.files
            .insert(path.trim_start_matches('/').to_string(), content);
    }
}

impl Resolve for MockResolver {
    type Stream = io::Cursor<Vec<u8>>;

    fn resolve(&self, path: &str) -> Result<Resource<Self::Stream>> {
        match self.files.get(path.trim_start_matches('/')) {
            Some(content) => Ok(Resource {
                stream: io::Cursor::new(content.clone()),
                size: content.len() as u64,
            }),
            None => Err(Error::NotFound(path.to_string())),
        }
    }
}

pub type MockServer = Server<MockTransport, MockResolver>;

/// Deterministic file content, distinct per seed.
pub fn content(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn config(policy: Policy, quanta: Quanta) -> Config {
    Config {
        policy,
        quanta,
        chunk_size: 4,
        ..Default::default()
    }
}

/// A server with one file per entry of `sizes`, at `/f<index>`, and one connection queued per
/// file. Connection ids are the file indices.
pub fn server_with_requests(config: Config, sizes: &[usize]) -> MockServer {
    let mut resolver = MockResolver::default();
    let mut transport = MockTransport::default();

    for (i, &size) in sizes.iter().enumerate() {
        let path = format!("/f{i}");
        resolver.add(&path, content(size, i as u8));
        transport.push(MockConnection::get(i as u64, &path));
    }

    Server::with_transport(config, transport, resolver).unwrap()
}

/// Steps until the table is empty. Panics if that takes more than `step_max` passes.
pub fn drain(server: &mut MockServer, step_max: usize) -> usize {
    for steps in 1..=step_max {
        server.step();

        if server.table().is_empty() {
            return steps;
        }
    }

    panic!("table not empty after {step_max} steps");
}
