/*

A file server which serves many clients at once from a single thread, by slicing transfers into
rounds and deciding which client goes next the way an operating system decides which process runs
next.

# Protocol

Each connection carries exactly one request of the form

  GET <path> ...

and receives exactly one status line, terminated by a blank line:

  HTTP/1.1 200 OK            followed by the file, then close
  HTTP/1.1 400 Bad request   not a GET line
  HTTP/1.1 404 File not found path is not a regular file under the root
  HTTP/1.1 503 Server busy   request table is full

# Request control blocks

Every admitted request gets a request control block (RCB) holding its connection, an open file
positioned at the next unsent byte, the number of bytes not yet sent, the quantum granted for the
next round, and a feedback level. RCBs live in a bounded table. Ids are sequence numbers assigned at
admission and are never reused.

# Rounds

The server loop repeats:

  1. admit every connection whose request has arrived
  2. plan: order the table and grant each RCB a quantum
  3. run: for each RCB in planned order, move up to its quantum of bytes from file to socket
  4. reap: evict RCBs which finished or failed, closing their connections

When the table is empty the loop blocks until something arrives.

Planning only ever looks at (bytes remaining, feedback level, id), so the same table always yields
the same plan.

# Policies

Round robin (RR): order by id. Every RCB gets the same fixed quantum.

  id  remaining   round 1   round 2   round 3      quantum = 10
   1     25          10        10         5 done
   2      5           5 done
   3     15          10         5 done

Shortest job first (SJF): order by bytes remaining. Each RCB's quantum is everything it has left, so
the first RCB in the plan finishes before the second starts. Non-preemptive; a job is never split
across rounds.

Multilevel feedback (MLFB): order by feedback level, then id. The quantum depends on the level:

  level 0    8 KiB
  level 1   64 KiB
  level 2+  unbounded

An RCB which uses its whole quantum without finishing drops one level. Levels never go back up, so a
stream of short new requests can starve a long one. That is the policy working as intended.

Ties are broken by id under every policy.

# Failure

A read or write error ends that one transfer; the RCB is evicted in the same round and no other RCB
is affected. Writes are retried until every byte read has been accepted. A client which accepts
nothing for the write timeout fails its transfer instead of stalling everyone else.

*/

pub mod error;
pub mod policy;
pub mod request;
pub mod resolve;
pub mod server;
pub mod transport;

pub use error::{Error, Result};
pub use policy::Policy;

pub type Server = server::Server<transport::TcpTransport, resolve::Resolver>;
pub type Config = server::Config;
