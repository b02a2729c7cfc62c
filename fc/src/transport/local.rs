//! In-process group transport
//!
//! Simulates N ranks inside one process: each rank owns a [`LocalTransport`]
//! and runs on its own thread. Peers push contributions into the leader's
//! inbox; the leader pushes broadcast results into each peer's inbox. An
//! optional receive timeout plays the role of the external supervisor, so
//! a silent or crashed leader surfaces as a collective failure instead of a
//! hang.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Frame, LEADER, RankIdentity, ReduceOp, Scalar, Transport, combine};
use crate::error::CoordError;

enum Role {
    Leader {
        inbox: Receiver<Frame>,
        peers: Vec<Sender<Frame>>,
        /// Contributions that arrived ahead of the current collective
        stash: Vec<Frame>,
    },
    Peer {
        to_leader: Sender<Frame>,
        inbox: Receiver<Frame>,
    },
}

/// One rank's endpoint of a [`LocalGroup`]
pub struct LocalTransport {
    identity: RankIdentity,
    role: Role,
    seq: u64,
    timeout: Option<Duration>,
}

/// Factory for in-process groups
pub struct LocalGroup;

impl LocalGroup {
    /// Form a group of `size` ranks; element `i` of the result is rank `i`
    pub fn form(size: usize, timeout: Option<Duration>) -> Result<Vec<LocalTransport>, CoordError> {
        let leader_identity = RankIdentity::new(LEADER, size)?;
        debug!(size, ?timeout, "LocalGroup::form: called");

        let (to_leader, leader_inbox) = mpsc::channel();
        let mut peer_senders = Vec::with_capacity(size.saturating_sub(1));
        let mut peers = Vec::with_capacity(size.saturating_sub(1));

        for rank in 1..size {
            let (tx, rx) = mpsc::channel();
            peer_senders.push(tx);
            peers.push(LocalTransport {
                identity: RankIdentity::new(rank, size)?,
                role: Role::Peer {
                    to_leader: to_leader.clone(),
                    inbox: rx,
                },
                seq: 0,
                timeout,
            });
        }

        let leader = LocalTransport {
            identity: leader_identity,
            role: Role::Leader {
                inbox: leader_inbox,
                peers: peer_senders,
                stash: Vec::new(),
            },
            seq: 0,
            timeout,
        };

        let mut group = Vec::with_capacity(size);
        group.push(leader);
        group.extend(peers);
        Ok(group)
    }
}

fn receive(inbox: &Receiver<Frame>, timeout: Option<Duration>, op: &str, rank: usize) -> Result<Frame, CoordError> {
    match timeout {
        Some(limit) => inbox.recv_timeout(limit).map_err(|e| match e {
            RecvTimeoutError::Timeout => {
                warn!(rank, op, ?limit, "Collective timed out");
                CoordError::collective(op, rank, format!("timed out after {:?}", limit))
            }
            RecvTimeoutError::Disconnected => CoordError::collective(op, rank, "group member disconnected"),
        }),
        None => inbox
            .recv()
            .map_err(|_| CoordError::collective(op, rank, "group member disconnected")),
    }
}

fn mismatch(op: &str, rank: usize, detail: impl std::fmt::Display) -> CoordError {
    CoordError::collective(op, rank, format!("mismatched call sequence: {}", detail))
}

impl Transport for LocalTransport {
    fn identity(&self) -> RankIdentity {
        self.identity
    }

    fn reduce(&mut self, op: ReduceOp, value: Scalar) -> Result<Option<Scalar>, CoordError> {
        self.seq += 1;
        let seq = self.seq;
        let rank = self.identity.rank;
        let size = self.identity.size;
        let op_name = op.to_string();

        match &mut self.role {
            Role::Peer { to_leader, .. } => {
                to_leader
                    .send(Frame::Contribute { rank, seq, op, value })
                    .map_err(|_| CoordError::collective(&op_name, rank, "leader is gone"))?;
                Ok(None)
            }
            Role::Leader { inbox, stash, .. } => {
                let mut slots: Vec<Option<Scalar>> = vec![None; size];
                slots[LEADER] = Some(value);
                let mut missing = size - 1;

                let place = |frame: Frame, slots: &mut Vec<Option<Scalar>>| -> Result<(), CoordError> {
                    match frame {
                        Frame::Contribute {
                            rank: from,
                            op: their_op,
                            value,
                            ..
                        } => {
                            if their_op != op {
                                return Err(mismatch(&op_name, from, format!("expected {}, got {}", op, their_op)));
                            }
                            if from == LEADER || from >= slots.len() || slots[from].is_some() {
                                return Err(mismatch(&op_name, from, "unexpected or duplicate contribution"));
                            }
                            slots[from] = Some(value);
                            Ok(())
                        }
                        other => Err(mismatch(&op_name, rank, format!("unexpected frame {:?}", other))),
                    }
                };

                let early: Vec<Frame> = std::mem::take(stash);
                for frame in early {
                    if frame.seq() == Some(seq) {
                        place(frame, &mut slots)?;
                        missing -= 1;
                    } else {
                        stash.push(frame);
                    }
                }

                while missing > 0 {
                    let frame = receive(inbox, self.timeout, &op_name, rank)?;
                    match frame.seq() {
                        Some(s) if s == seq => {
                            place(frame, &mut slots)?;
                            missing -= 1;
                        }
                        Some(s) if s > seq => stash.push(frame),
                        other => {
                            return Err(mismatch(&op_name, rank, format!("expected seq {}, got {:?}", seq, other)));
                        }
                    }
                }

                let values: Vec<Scalar> = slots.into_iter().flatten().collect();
                let reduced = combine(op, &values).map_err(|e| mismatch(&op_name, rank, e))?;
                debug!(seq, %op, ?reduced, "LocalTransport::reduce: leader reduced");
                Ok(Some(reduced))
            }
        }
    }

    fn broadcast(&mut self, value: Option<Scalar>) -> Result<Scalar, CoordError> {
        self.seq += 1;
        let seq = self.seq;
        let rank = self.identity.rank;

        match &mut self.role {
            Role::Leader { peers, .. } => {
                let value = value
                    .ok_or_else(|| CoordError::collective("broadcast", rank, "leader broadcast without a value"))?;
                for (i, peer) in peers.iter().enumerate() {
                    peer.send(Frame::Result { seq, value })
                        .map_err(|_| CoordError::collective("broadcast", i + 1, "group member disconnected"))?;
                }
                Ok(value)
            }
            Role::Peer { inbox, .. } => match receive(inbox, self.timeout, "broadcast", rank)? {
                Frame::Result { seq: s, value } if s == seq => Ok(value),
                other => Err(mismatch("broadcast", rank, format!("expected result {}, got {:?}", seq, other))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn all_min(t: &mut LocalTransport, v: u64) -> Result<Scalar, CoordError> {
        let reduced = t.reduce(ReduceOp::Min, Scalar::Count(v))?;
        t.broadcast(reduced)
    }

    #[test]
    fn test_form_assigns_ranks() {
        let group = LocalGroup::form(3, None).unwrap();
        let ranks: Vec<usize> = group.iter().map(|t| t.identity().rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(group.iter().all(|t| t.identity().size == 3));
        assert!(LocalGroup::form(0, None).is_err());
    }

    #[test]
    fn test_min_then_broadcast_reaches_every_rank() {
        let group = LocalGroup::form(2, Some(Duration::from_secs(5))).unwrap();
        let proposals = [10u64, 7];

        let handles: Vec<_> = group
            .into_iter()
            .zip(proposals)
            .map(|(mut t, p)| thread::spawn(move || all_min(&mut t, p).unwrap()))
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Scalar::Count(7));
        }
    }

    #[test]
    fn test_consecutive_collectives_stay_ordered() {
        let group = LocalGroup::form(4, Some(Duration::from_secs(5))).unwrap();

        let handles: Vec<_> = group
            .into_iter()
            .map(|mut t| {
                thread::spawn(move || {
                    let r = t.identity().rank as u64;
                    let mut seen = Vec::new();
                    for round in 0..20u64 {
                        let sum = t.reduce(ReduceOp::Sum, Scalar::Count(r + round)).unwrap();
                        seen.push(t.broadcast(sum).unwrap());
                    }
                    seen
                })
            })
            .collect();

        let results: Vec<Vec<Scalar>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for round in 0..20u64 {
            let expected = Scalar::Count(6 + 4 * round);
            for per_rank in &results {
                assert_eq!(per_rank[round as usize], expected);
            }
        }
    }

    #[test]
    fn test_mismatched_op_is_collective_failure() {
        let mut group = LocalGroup::form(2, Some(Duration::from_secs(5))).unwrap();
        let mut peer = group.pop().unwrap();
        let mut leader = group.pop().unwrap();

        let peer_handle = thread::spawn(move || peer.reduce(ReduceOp::Sum, Scalar::Count(1)));
        let err = leader.reduce(ReduceOp::Min, Scalar::Count(1)).unwrap_err();
        assert!(err.is_collective_failure());
        assert!(err.to_string().contains("mismatched"));
        assert!(peer_handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_dropped_leader_fails_peer() {
        let mut group = LocalGroup::form(2, None).unwrap();
        let mut peer = group.pop().unwrap();
        drop(group);

        let err = all_min(&mut peer, 3).unwrap_err();
        assert!(err.is_collective_failure());
    }

    #[test]
    fn test_silent_leader_times_out() {
        let mut group = LocalGroup::form(2, Some(Duration::from_millis(100))).unwrap();
        let mut peer = group.pop().unwrap();
        let _leader = group.pop().unwrap();

        peer.reduce(ReduceOp::Min, Scalar::Count(3)).unwrap();
        let err = peer.broadcast(None).unwrap_err();
        assert!(err.is_collective_failure());
        assert!(err.to_string().contains("timed out"));
    }
}
