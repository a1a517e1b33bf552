use std::collections::{HashMap, VecDeque};
use std::io;
use std::net;
use std::time;

use tracing::{debug, warn};

const LISTENER_POLLING_KEY: usize = 0;

// Accepting stops for this long after the process runs out of a resource
const ACCEPT_BACKOFF: time::Duration = time::Duration::from_millis(100);

/// A client connection carrying a single request.
pub trait Connection: io::Read + io::Write {
    /// Identifier unique among all connections produced by the same transport.
    fn id(&self) -> u64;
}

/// Source of client connections.
pub trait Transport {
    type Connection: Connection;

    /// Returns the next connection whose request is ready to be read, without blocking. Returns
    /// Ok(None) if no such connection exists right now.
    fn accept_ready(&mut self) -> io::Result<Option<Self::Connection>>;

    /// Blocks for up to `timeout` (forever if `None`) waiting for a connection to become ready.
    /// May return early, or spuriously.
    fn await_arrivals(&mut self, timeout: Option<time::Duration>) -> io::Result<()>;

    /// Hands a connection back for closing.
    fn close(&mut self, connection: Self::Connection);
}

pub struct TcpConnection {
    stream: net::TcpStream,
    id: u64,
    peer_addr: net::SocketAddr,
}

// Accepted, but the request has not arrived yet
struct PendingConnection {
    connection: TcpConnection,
    accepted_at: time::Instant,
}

/// TCP transport. Accepted sockets are held back until their request bytes have arrived, so a
/// client which connects and says nothing never reaches the scheduler. Such clients are dropped
/// once the request timeout passes.
pub struct TcpTransport {
    // Non-blocking listening socket
    listener: net::TcpListener,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Accepted, waiting for a request (keyed by polling key)
    pending: HashMap<usize, PendingConnection>,
    // Readable, waiting to be handed out
    ready: VecDeque<TcpConnection>,
    // Connection ids double as polling keys, so they start past the listener's
    next_id: u64,
    // Pending connections older than this are dropped
    request_timeout: Option<time::Duration>,
    // Applied to connections once handed out
    write_timeout: Option<time::Duration>,
    // Set after accept() fails for want of a resource
    accept_paused_until: Option<time::Instant>,
}

impl io::Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl io::Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }
}

impl TcpTransport {
    /// Binds a listening socket. Connections which send no request within `request_timeout` are
    /// closed. Writes to handed-out connections which make no progress for `write_timeout` fail
    /// rather than block.
    pub fn bind<A>(
        bind_address: A,
        request_timeout: Option<time::Duration>,
        write_timeout: Option<time::Duration>,
    ) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        let listener = net::TcpListener::bind(bind_address)?;
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&listener, polling::Event::readable(LISTENER_POLLING_KEY))?;
        }

        Ok(Self {
            listener,
            local_addr,
            poller,
            poller_events: polling::Events::new(),
            pending: HashMap::new(),
            ready: VecDeque::new(),
            next_id: LISTENER_POLLING_KEY as u64 + 1,
            request_timeout,
            write_timeout,
            accept_paused_until: None,
        })
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    fn accept_paused(&mut self, now: time::Instant) -> bool {
        match self.accept_paused_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.accept_paused_until = None;
                false
            }
            None => false,
        }
    }

    /// Accepts every queued connection without blocking and registers each for readability.
    fn accept_pending(&mut self) {
        if self.accept_paused(time::Instant::now()) {
            return;
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let id = self.next_id;
                    self.next_id += 1;

                    if let Err(err) = self.register(stream, id, peer_addr) {
                        warn!(id, %peer_addr, error = %err, "failed to register connection");
                    }
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => (),
                    // A client which gave up before we got to it is not our problem
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                        warn!(error = %err, "accept failed");
                    }
                    _ => {
                        self.accept_failed(err);
                        return;
                    }
                },
            }
        }
    }

    /// Stops accepting for a while. Connections stay queued in the listen backlog until then.
    fn accept_failed(&mut self, err: io::Error) {
        warn!(
            error = %err,
            pending = self.pending.len(),
            "accept failed, pausing for {:?}",
            ACCEPT_BACKOFF
        );

        self.accept_paused_until = Some(time::Instant::now() + ACCEPT_BACKOFF);
    }

    fn register(
        &mut self,
        stream: net::TcpStream,
        id: u64,
        peer_addr: net::SocketAddr,
    ) -> io::Result<()> {
        stream.set_nonblocking(true)?;

        let key = id as usize;

        unsafe {
            self.poller.add(&stream, polling::Event::readable(key))?;
        }

        debug!(id, %peer_addr, "accepted connection");

        self.pending.insert(
            key,
            PendingConnection {
                connection: TcpConnection {
                    stream,
                    id,
                    peer_addr,
                },
                accepted_at: time::Instant::now(),
            },
        );

        Ok(())
    }

    /// Moves a readable pending connection to the ready queue, switching it to blocking mode. A
    /// connection which cannot be switched is dropped.
    fn promote(&mut self, key: usize) {
        let Some(PendingConnection { connection, .. }) = self.pending.remove(&key) else {
            return;
        };

        let result = self.poller.delete(&connection.stream).and_then(|()| {
            connection.stream.set_nonblocking(false)?;
            connection.stream.set_write_timeout(self.write_timeout)?;
            connection.stream.set_read_timeout(self.write_timeout)
        });

        match result {
            Ok(()) => self.ready.push_back(connection),
            Err(err) => {
                warn!(
                    id = connection.id,
                    peer_addr = %connection.peer_addr,
                    error = %err,
                    "failed to promote connection"
                );
            }
        }
    }

    /// Drops pending connections which have waited longer than the request timeout.
    fn expire_pending(&mut self, now: time::Instant) {
        let Some(timeout) = self.request_timeout else {
            return;
        };

        let expired = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.accepted_at) >= timeout)
            .map(|(&key, _)| key)
            .collect::<Vec<_>>();

        for key in expired {
            if let Some(PendingConnection { connection, .. }) = self.pending.remove(&key) {
                debug!(id = connection.id, peer_addr = %connection.peer_addr, "request timed out");

                let _ = self.poller.delete(&connection.stream);
            }
        }
    }

    fn poll(&mut self, timeout: Option<time::Duration>) -> io::Result<()> {
        let now = time::Instant::now();

        let mut timeout = timeout;

        if self.accept_paused(now) {
            // Leave the listener disarmed, but wake up once the pause is over
            if let Some(until) = self.accept_paused_until {
                let remaining = until.saturating_duration_since(now);
                timeout = Some(timeout.map_or(remaining, |t| t.min(remaining)));
            }
        } else {
            // Interest is oneshot and must be re-armed prior to each wait() call
            self.poller.modify(
                &self.listener,
                polling::Event::readable(LISTENER_POLLING_KEY),
            )?;
        }

        self.poller_events.clear();

        self.poller.wait(&mut self.poller_events, timeout)?;

        let keys = self
            .poller_events
            .iter()
            .map(|event| event.key)
            .collect::<Vec<_>>();

        for key in keys {
            if key == LISTENER_POLLING_KEY {
                self.accept_pending();
            } else {
                self.promote(key);
            }
        }

        self.expire_pending(time::Instant::now());

        Ok(())
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    fn accept_ready(&mut self) -> io::Result<Option<TcpConnection>> {
        if self.ready.is_empty() {
            self.accept_pending();
            self.poll(Some(time::Duration::ZERO))?;
        }

        Ok(self.ready.pop_front())
    }

    fn await_arrivals(&mut self, timeout: Option<time::Duration>) -> io::Result<()> {
        if self.ready.is_empty() {
            self.poll(timeout)?;
        }

        Ok(())
    }

    fn close(&mut self, connection: TcpConnection) {
        debug!(id = connection.id, peer_addr = %connection.peer_addr, "closing connection");

        let _ = connection.stream.shutdown(net::Shutdown::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};

    #[test]
    fn ready_only_after_request() {
        let mut transport = TcpTransport::bind(("127.0.0.1", 0), None, None).unwrap();
        let addr = transport.local_addr();

        let mut client = net::TcpStream::connect(addr).unwrap();

        // Connected but silent
        for _ in 0..10 {
            assert!(transport.accept_ready().unwrap().is_none());
        }

        client.write_all(b"GET /x HTTP/1.1\r\n\r\n").unwrap();

        let mut connection = None;

        for _ in 0..100 {
            transport
                .await_arrivals(Some(time::Duration::from_millis(50)))
                .unwrap();

            if let Some(c) = transport.accept_ready().unwrap() {
                connection = Some(c);
                break;
            }
        }

        let mut connection = connection.expect("connection never became ready");

        let mut buf = [0u8; 64];
        let n = connection.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"GET /x HTTP/1.1\r\n\r\n");

        connection.write_all(b"HTTP/1.1 200 OK\n\nhi").unwrap();
        transport.close(connection);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"HTTP/1.1 200 OK\n\nhi");
    }

    #[test]
    fn distinct_ids() {
        let mut transport = TcpTransport::bind(("127.0.0.1", 0), None, None).unwrap();
        let addr = transport.local_addr();

        let mut clients = (0..3)
            .map(|_| net::TcpStream::connect(addr).unwrap())
            .collect::<Vec<_>>();

        for client in clients.iter_mut() {
            client.write_all(b"GET /x\n").unwrap();
        }

        let mut ids = Vec::new();

        for _ in 0..200 {
            transport
                .await_arrivals(Some(time::Duration::from_millis(20)))
                .unwrap();

            while let Some(c) = transport.accept_ready().unwrap() {
                ids.push(c.id());
            }

            if ids.len() == 3 {
                break;
            }
        }

        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&(LISTENER_POLLING_KEY as u64)));
    }

    #[test]
    fn silent_connection_times_out() {
        let request_timeout = time::Duration::from_millis(50);

        let mut transport =
            TcpTransport::bind(("127.0.0.1", 0), Some(request_timeout), None).unwrap();
        let addr = transport.local_addr();

        let mut client = net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(time::Duration::from_secs(5)))
            .unwrap();

        for _ in 0..200 {
            transport
                .await_arrivals(Some(time::Duration::from_millis(10)))
                .unwrap();

            assert!(transport.accept_ready().unwrap().is_none());

            if transport.next_id > 1 && transport.pending.is_empty() {
                break;
            }
        }

        assert_eq!(transport.next_id, 2, "connection never accepted");
        assert!(transport.pending.is_empty(), "connection never expired");

        // Closed without a reply
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn accept_pauses_after_resource_failure() {
        let mut transport = TcpTransport::bind(("127.0.0.1", 0), None, None).unwrap();
        let addr = transport.local_addr();

        let t0 = time::Instant::now();

        transport.accept_failed(io::Error::new(io::ErrorKind::Other, "too many open files"));

        let mut client = net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET /x\n").unwrap();

        // Held in the listen backlog
        assert!(transport.accept_ready().unwrap().is_none());
        assert!(transport.pending.is_empty());

        let mut connection = None;

        for _ in 0..100 {
            transport
                .await_arrivals(Some(time::Duration::from_millis(50)))
                .unwrap();

            if let Some(c) = transport.accept_ready().unwrap() {
                connection = Some(c);
                break;
            }
        }

        assert!(connection.is_some(), "accepting never resumed");
        assert!(t0.elapsed() >= ACCEPT_BACKOFF);
    }
}
