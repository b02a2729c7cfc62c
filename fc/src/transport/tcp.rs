//! TCP star transport for multi-process runs
//!
//! The leader binds a listener and accepts one connection per peer; every
//! collective goes peer -> leader (contribution) and leader -> peer (result).
//! The leader reads contributions in rank order, so no reordering is needed.
//!
//! Socket I/O runs on a current-thread tokio runtime owned by the transport.
//! Collectives stay blocking: each one is driven to completion with
//! `block_on` from the coordinator's thread.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Frame, LEADER, RankIdentity, ReduceOp, Scalar, Transport, combine};
use crate::error::CoordError;

/// Pause between connection attempts while waiting for the group to form
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum frame size; a scalar frame is well under 200 bytes
const MAX_FRAME_SIZE: usize = 1024;

/// Connection and collective timeouts
#[derive(Debug, Clone, Copy)]
pub struct TcpOptions {
    /// How long group formation may take
    pub connect_timeout: Duration,
    /// Deadline for each socket read/write inside collectives; `None` waits forever
    pub collective_timeout: Option<Duration>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            collective_timeout: None,
        }
    }
}

/// Run `fut`, giving up after `limit` if one is set
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn io_runtime() -> Result<Runtime, CoordError> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

/// One socket between this rank and `peer`
struct Link {
    local: usize,
    peer: usize,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Option<Duration>,
}

impl Link {
    fn new(local: usize, peer: usize, stream: TcpStream, timeout: Option<Duration>) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            local,
            peer,
            reader: BufReader::new(read),
            writer: write,
            timeout,
        })
    }

    fn failure(&self, op: &str, reason: impl std::fmt::Display) -> CoordError {
        CoordError::collective(op, self.local, format!("link to rank {}: {}", self.peer, reason))
    }

    async fn send(&mut self, frame: &Frame, op: &str) -> Result<(), CoordError> {
        let line = frame.to_line()?;
        let writer = &mut self.writer;
        let written = within(self.timeout, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await;

        match written {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(self.failure(op, format!("send failed: {}", e))),
            None => {
                warn!(rank = self.local, peer = self.peer, op, timeout = ?self.timeout, "Collective send timed out");
                Err(self.failure(op, format!("send timed out after {:?}", self.timeout.unwrap_or_default())))
            }
        }
    }

    async fn recv(&mut self, op: &str) -> Result<Frame, CoordError> {
        let mut line = String::new();
        match within(self.timeout, self.reader.read_line(&mut line)).await {
            Some(Ok(0)) => Err(self.failure(op, "connection closed")),
            Some(Ok(n)) if n > MAX_FRAME_SIZE => Err(self.failure(op, format!("frame too large: {} bytes", n))),
            Some(Ok(_)) => Frame::from_line(&line).map_err(|e| self.failure(op, format!("malformed frame: {}", e))),
            Some(Err(e)) => Err(self.failure(op, format!("receive failed: {}", e))),
            None => {
                warn!(rank = self.local, peer = self.peer, op, timeout = ?self.timeout, "Collective timed out");
                Err(self.failure(op, format!("timed out after {:?}", self.timeout.unwrap_or_default())))
            }
        }
    }
}

enum Role {
    /// Peer links in rank order, starting at rank 1
    Leader { peers: Vec<Link> },
    Peer { leader: Link },
}

/// One rank's endpoint of a TCP group
pub struct TcpTransport {
    identity: RankIdentity,
    role: Role,
    seq: u64,
    // Declared last so the sockets are dropped before their runtime
    runtime: Runtime,
}

impl TcpTransport {
    /// Bind (leader) or connect (peer) depending on `identity`
    pub fn establish(identity: RankIdentity, leader_addr: &str, options: TcpOptions) -> Result<Self, CoordError> {
        if identity.is_leader() {
            let runtime = io_runtime()
                .map_err(|e| CoordError::ResourceAllocation(format!("I/O runtime for leader: {}", e)))?;
            let role = runtime.block_on(async {
                let listener = TcpListener::bind(leader_addr)
                    .await
                    .map_err(|e| CoordError::ResourceAllocation(format!("cannot bind {}: {}", leader_addr, e)))?;
                accept_peers(listener, identity.size, options).await
            })?;
            Ok(Self::assemble(identity, role, runtime))
        } else {
            Self::join(identity, leader_addr, options)
        }
    }

    /// Accept `size - 1` peers on an already bound listener
    pub fn lead(listener: std::net::TcpListener, size: usize, options: TcpOptions) -> Result<Self, CoordError> {
        let identity = RankIdentity::new(LEADER, size)?;
        let runtime = io_runtime()
            .map_err(|e| CoordError::ResourceAllocation(format!("I/O runtime for leader: {}", e)))?;
        let role = runtime.block_on(async move {
            listener
                .set_nonblocking(true)
                .map_err(|e| CoordError::ResourceAllocation(format!("listener setup: {}", e)))?;
            let listener = TcpListener::from_std(listener)
                .map_err(|e| CoordError::ResourceAllocation(format!("listener setup: {}", e)))?;
            accept_peers(listener, size, options).await
        })?;
        Ok(Self::assemble(identity, role, runtime))
    }

    /// Connect to the leader, retrying until the connect timeout expires
    pub fn join(identity: RankIdentity, leader_addr: &str, options: TcpOptions) -> Result<Self, CoordError> {
        let runtime = io_runtime()?;
        let role = runtime.block_on(connect_leader(identity, leader_addr, options))?;
        Ok(Self::assemble(identity, role, runtime))
    }

    fn assemble(identity: RankIdentity, role: Role, runtime: Runtime) -> Self {
        Self {
            identity,
            role,
            seq: 0,
            runtime,
        }
    }
}

async fn accept_peers(listener: TcpListener, size: usize, options: TcpOptions) -> Result<Role, CoordError> {
    let local = listener.local_addr()?;
    info!(%local, size, "Leader waiting for peers");

    let mut slots: Vec<Option<Link>> = Vec::new();
    slots
        .try_reserve_exact(size)
        .map_err(|e| CoordError::ResourceAllocation(format!("peer slot table for {} ranks: {}", size, e)))?;
    slots.resize_with(size, || None);

    let deadline = Instant::now() + options.connect_timeout;
    let mut joined = 1;
    while joined < size {
        let (stream, addr) = match tokio::time::timeout_at(deadline, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => return Err(CoordError::collective("connect", LEADER, format!("accept failed: {}", e))),
            Err(_) => {
                return Err(CoordError::collective(
                    "connect",
                    LEADER,
                    format!("only {} of {} ranks joined within {:?}", joined, size, options.connect_timeout),
                ));
            }
        };

        let mut link = Link::new(LEADER, LEADER, stream, Some(options.connect_timeout))?;
        match link.recv("connect").await? {
            Frame::Hello { rank, size: their_size }
                if their_size == size && rank != LEADER && rank < size && slots[rank].is_none() =>
            {
                debug!(rank, %addr, "Peer joined");
                link.peer = rank;
                link.timeout = options.collective_timeout;
                slots[rank] = Some(link);
                joined += 1;
            }
            other => {
                return Err(CoordError::collective(
                    "connect",
                    LEADER,
                    format!("bad introduction from {}: {:?}", addr, other),
                ));
            }
        }
    }

    info!(size, "All peers joined");
    Ok(Role::Leader {
        peers: slots.into_iter().skip(1).flatten().collect(),
    })
}

async fn connect_leader(identity: RankIdentity, leader_addr: &str, options: TcpOptions) -> Result<Role, CoordError> {
    let addr = tokio::net::lookup_host(leader_addr)
        .await
        .map_err(|e| CoordError::Configuration(format!("invalid leader address {}: {}", leader_addr, e)))?
        .next()
        .ok_or_else(|| CoordError::Configuration(format!("leader address {} did not resolve", leader_addr)))?;

    let unreachable = || {
        CoordError::collective(
            "connect",
            identity.rank,
            format!("leader at {} unreachable within {:?}", addr, options.connect_timeout),
        )
    };

    let deadline = Instant::now() + options.connect_timeout;
    let stream = loop {
        match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) => {
                debug!(rank = identity.rank, %addr, error = %e, "Leader not reachable yet");
                if Instant::now() + RETRY_INTERVAL >= deadline {
                    return Err(unreachable());
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(_) => return Err(unreachable()),
        }
    };

    let mut leader = Link::new(identity.rank, LEADER, stream, options.collective_timeout)?;
    leader
        .send(
            &Frame::Hello {
                rank: identity.rank,
                size: identity.size,
            },
            "connect",
        )
        .await?;
    info!(rank = identity.rank, %addr, "Joined group");

    Ok(Role::Peer { leader })
}

impl Transport for TcpTransport {
    fn identity(&self) -> RankIdentity {
        self.identity
    }

    fn reduce(&mut self, op: ReduceOp, value: Scalar) -> Result<Option<Scalar>, CoordError> {
        self.seq += 1;
        let seq = self.seq;
        let rank = self.identity.rank;
        let op_name = op.to_string();
        let role = &mut self.role;

        self.runtime.block_on(async move {
            match role {
                Role::Peer { leader } => {
                    leader.send(&Frame::Contribute { rank, seq, op, value }, &op_name).await?;
                    Ok(None)
                }
                Role::Leader { peers } => {
                    let mut values = Vec::with_capacity(peers.len() + 1);
                    values.push(value);
                    for link in peers.iter_mut() {
                        match link.recv(&op_name).await? {
                            Frame::Contribute {
                                rank: from,
                                seq: s,
                                op: their_op,
                                value,
                            } if from == link.peer && s == seq && their_op == op => values.push(value),
                            other => {
                                return Err(link.failure(
                                    &op_name,
                                    format!("mismatched call sequence: expected {} #{}, got {:?}", op, seq, other),
                                ));
                            }
                        }
                    }
                    let reduced = combine(op, &values).map_err(|e| {
                        CoordError::collective(&op_name, rank, format!("mismatched call sequence: {}", e))
                    })?;
                    Ok(Some(reduced))
                }
            }
        })
    }

    fn broadcast(&mut self, value: Option<Scalar>) -> Result<Scalar, CoordError> {
        self.seq += 1;
        let seq = self.seq;
        let rank = self.identity.rank;
        let role = &mut self.role;

        self.runtime.block_on(async move {
            match role {
                Role::Leader { peers } => {
                    let value = value
                        .ok_or_else(|| CoordError::collective("broadcast", rank, "leader broadcast without a value"))?;
                    let frame = Frame::Result { seq, value };
                    for link in peers.iter_mut() {
                        link.send(&frame, "broadcast").await?;
                    }
                    Ok(value)
                }
                Role::Peer { leader } => match leader.recv("broadcast").await? {
                    Frame::Result { seq: s, value } if s == seq => Ok(value),
                    other => Err(leader.failure(
                        "broadcast",
                        format!("mismatched call sequence: expected result #{}, got {:?}", seq, other),
                    )),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn options() -> TcpOptions {
        TcpOptions {
            connect_timeout: Duration::from_secs(5),
            collective_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn loopback() -> (std::net::TcpListener, String) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[test]
    fn test_group_forms_and_reduces() {
        let (listener, addr) = loopback();
        let size = 3;

        let leader = thread::spawn(move || {
            let mut t = TcpTransport::lead(listener, size, options()).unwrap();
            let min = t.reduce(ReduceOp::Min, Scalar::Count(10)).unwrap();
            let min = t.broadcast(min).unwrap();
            let sum = t.reduce(ReduceOp::Sum, Scalar::Real(1.0)).unwrap();
            let sum = t.broadcast(sum).unwrap();
            (min, sum)
        });

        let peers: Vec<_> = (1..size)
            .map(|rank| {
                let addr = addr.clone();
                thread::spawn(move || {
                    let identity = RankIdentity::new(rank, size).unwrap();
                    let mut t = TcpTransport::join(identity, &addr, options()).unwrap();
                    let min = t.reduce(ReduceOp::Min, Scalar::Count(5 + rank as u64)).unwrap();
                    assert!(min.is_none());
                    let min = t.broadcast(None).unwrap();
                    t.reduce(ReduceOp::Sum, Scalar::Real(rank as f64)).unwrap();
                    let sum = t.broadcast(None).unwrap();
                    (min, sum)
                })
            })
            .collect();

        let expected = (Scalar::Count(6), Scalar::Real(4.0));
        assert_eq!(leader.join().unwrap(), expected);
        for p in peers {
            assert_eq!(p.join().unwrap(), expected);
        }
    }

    #[test]
    fn test_establish_leader_on_taken_address_is_resource_allocation() {
        let (_held, addr) = loopback();
        let identity = RankIdentity::new(LEADER, 2).unwrap();

        let err = TcpTransport::establish(identity, &addr, options()).err().unwrap();

        assert!(matches!(err, CoordError::ResourceAllocation(_)), "unexpected error: {}", err);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cannot bind"));
    }

    #[test]
    fn test_leader_gone_before_broadcast_fails_peer() {
        let (listener, addr) = loopback();

        let leader = thread::spawn(move || {
            let mut t = TcpTransport::lead(listener, 2, options()).unwrap();
            let reduced = t.reduce(ReduceOp::Min, Scalar::Count(10)).unwrap();
            // Exits without broadcasting
            drop(t);
            reduced
        });

        let identity = RankIdentity::new(1, 2).unwrap();
        let mut peer = TcpTransport::join(identity, &addr, options()).unwrap();
        peer.reduce(ReduceOp::Min, Scalar::Count(3)).unwrap();
        assert_eq!(leader.join().unwrap(), Some(Scalar::Count(3)));

        let err = peer.broadcast(None).unwrap_err();
        assert!(err.is_collective_failure());
        assert!(err.is_fatal());
        // The diagnostic names the failing process, not the vanished leader
        assert!(err.to_string().contains("failed on rank 1"), "unexpected error: {}", err);
        assert!(err.to_string().contains("link to rank 0"));
    }

    #[test]
    fn test_join_without_leader_fails() {
        let addr = {
            let (_listener, addr) = loopback();
            addr
        };
        let opts = TcpOptions {
            connect_timeout: Duration::from_millis(300),
            collective_timeout: None,
        };
        let identity = RankIdentity::new(1, 2).unwrap();
        let err = TcpTransport::join(identity, &addr, opts).err().unwrap();
        assert!(err.is_collective_failure());
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn test_leader_times_out_waiting_for_peers() {
        let (listener, _) = loopback();
        let opts = TcpOptions {
            connect_timeout: Duration::from_millis(200),
            collective_timeout: None,
        };
        let err = TcpTransport::lead(listener, 2, opts).err().unwrap();
        assert!(err.is_collective_failure());
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn test_silent_peer_times_out_leader() {
        let (listener, addr) = loopback();
        let opts = TcpOptions {
            connect_timeout: Duration::from_secs(5),
            collective_timeout: Some(Duration::from_millis(150)),
        };

        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let peer = thread::spawn(move || {
            let identity = RankIdentity::new(1, 2).unwrap();
            let _t = TcpTransport::join(identity, &addr, opts).unwrap();
            // Stay connected but never contribute
            let _ = done_rx.recv();
        });

        let mut leader = TcpTransport::lead(listener, 2, opts).unwrap();
        let err = leader.reduce(ReduceOp::Min, Scalar::Count(1)).unwrap_err();
        assert!(err.is_collective_failure());
        assert!(err.to_string().contains("failed on rank 0"));
        assert!(err.to_string().contains("timed out"));

        done_tx.send(()).unwrap();
        peer.join().unwrap();
    }
}
