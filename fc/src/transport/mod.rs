//! Group transports for blocking collective operations
//!
//! A transport moves one scalar per rank to the leader (reduce) and one
//! scalar from the leader to every rank (broadcast). Every call is a full
//! barrier: no rank returns from a broadcast until the leader has sent it.
//!
//! - [`SoloTransport`] - single-rank group
//! - [`LocalGroup`] - in-process group over channels (tests, simulation)
//! - [`TcpTransport`] - star topology over TCP for real multi-process runs

mod frame;
mod local;
mod tcp;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoordError;

pub use frame::Frame;
pub use local::{LocalGroup, LocalTransport};
pub use tcp::{TcpOptions, TcpTransport};

/// Rank id of the leader
pub const LEADER: usize = 0;

/// Position of this process within the group. Fixed at group formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankIdentity {
    pub rank: usize,
    pub size: usize,
}

impl RankIdentity {
    pub fn new(rank: usize, size: usize) -> Result<Self, CoordError> {
        if size == 0 {
            return Err(CoordError::Configuration("group size must be at least 1".to_string()));
        }
        if rank >= size {
            return Err(CoordError::Configuration(format!(
                "rank {} is out of range for a group of {}",
                rank, size
            )));
        }
        Ok(Self { rank, size })
    }

    /// Identity of the only rank in a single-process run
    pub fn solo() -> Self {
        Self { rank: LEADER, size: 1 }
    }

    pub fn is_leader(&self) -> bool {
        self.rank == LEADER
    }
}

impl fmt::Display for RankIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rank, self.size)
    }
}

/// Reduction applied at the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReduceOp {
    Min,
    Sum,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceOp::Min => write!(f, "reduce-min"),
            ReduceOp::Sum => write!(f, "reduce-sum"),
        }
    }
}

/// Value carried by a collective
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum Scalar {
    Count(u64),
    Real(f64),
}

impl Scalar {
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Scalar::Count(v) => Some(*v),
            Scalar::Real(_) => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Scalar::Real(v) => Some(*v),
            Scalar::Count(_) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Scalar::Count(_) => "count",
            Scalar::Real(_) => "real",
        }
    }
}

/// Fold contributions in rank order
///
/// `values[i]` must be the contribution of rank `i`; folding in a fixed order
/// keeps floating-point sums bit-identical from run to run.
pub fn combine(op: ReduceOp, values: &[Scalar]) -> Result<Scalar, String> {
    let (first, rest) = values.split_first().ok_or_else(|| "no contributions".to_string())?;
    let mut acc = *first;
    for value in rest {
        acc = match (acc, *value) {
            (Scalar::Count(a), Scalar::Count(b)) => match op {
                ReduceOp::Min => Scalar::Count(a.min(b)),
                ReduceOp::Sum => Scalar::Count(a.saturating_add(b)),
            },
            (Scalar::Real(a), Scalar::Real(b)) => match op {
                ReduceOp::Min => Scalar::Real(a.min(b)),
                ReduceOp::Sum => Scalar::Real(a + b),
            },
            (a, b) => {
                return Err(format!("scalar kind mismatch: {} vs {}", a.kind(), b.kind()));
            }
        };
    }
    Ok(acc)
}

/// Process-group-wide reduce and broadcast
///
/// Implementations are blocking and must be called in the same order on
/// every rank. Any failure is a [`CoordError::CollectiveFailure`] (or
/// [`CoordError::ResourceAllocation`] during leader setup).
pub trait Transport {
    fn identity(&self) -> RankIdentity;

    /// Contribute `value`; only the leader gets the reduced result back
    fn reduce(&mut self, op: ReduceOp, value: Scalar) -> Result<Option<Scalar>, CoordError>;

    /// The leader passes `Some(value)`; every rank returns that value
    fn broadcast(&mut self, value: Option<Scalar>) -> Result<Scalar, CoordError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn identity(&self) -> RankIdentity {
        (**self).identity()
    }

    fn reduce(&mut self, op: ReduceOp, value: Scalar) -> Result<Option<Scalar>, CoordError> {
        (**self).reduce(op, value)
    }

    fn broadcast(&mut self, value: Option<Scalar>) -> Result<Scalar, CoordError> {
        (**self).broadcast(value)
    }
}

/// Transport for a group of one
#[derive(Debug, Default)]
pub struct SoloTransport;

impl Transport for SoloTransport {
    fn identity(&self) -> RankIdentity {
        RankIdentity::solo()
    }

    fn reduce(&mut self, _op: ReduceOp, value: Scalar) -> Result<Option<Scalar>, CoordError> {
        Ok(Some(value))
    }

    fn broadcast(&mut self, value: Option<Scalar>) -> Result<Scalar, CoordError> {
        value.ok_or_else(|| CoordError::collective("broadcast", LEADER, "leader broadcast without a value"))
    }
}
