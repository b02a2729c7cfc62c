//! Typed collective primitives over a [`Transport`]
//!
//! `reduce_min`, `reduce_sum` and `broadcast` are the three primitives every
//! coordination step is built from. The `all_*` helpers pair a reduction
//! with a broadcast so every rank ends up holding the identical value.

use tracing::trace;

use crate::error::CoordError;
use crate::transport::{RankIdentity, ReduceOp, Scalar, Transport};

/// Collective operations for one rank
pub struct Collectives<T: Transport> {
    transport: T,
    identity: RankIdentity,
}

impl<T: Transport> Collectives<T> {
    pub fn new(transport: T) -> Self {
        let identity = transport.identity();
        Self { transport, identity }
    }

    pub fn identity(&self) -> RankIdentity {
        self.identity
    }

    /// Minimum of all contributions, available at the leader only
    pub fn reduce_min(&mut self, value: u64) -> Result<Option<u64>, CoordError> {
        let reduced = self.transport.reduce(ReduceOp::Min, Scalar::Count(value))?;
        self.expect_count(reduced, "reduce-min")
    }

    /// Sum of all contributions, available at the leader only
    pub fn reduce_sum(&mut self, value: u64) -> Result<Option<u64>, CoordError> {
        let reduced = self.transport.reduce(ReduceOp::Sum, Scalar::Count(value))?;
        self.expect_count(reduced, "reduce-sum")
    }

    /// Floating-point sum, folded in rank order at the leader
    pub fn reduce_sum_real(&mut self, value: f64) -> Result<Option<f64>, CoordError> {
        match self.transport.reduce(ReduceOp::Sum, Scalar::Real(value))? {
            None => Ok(None),
            Some(Scalar::Real(v)) => Ok(Some(v)),
            Some(other) => Err(self.kind_error("reduce-sum", other)),
        }
    }

    /// Send the leader's `value` to every rank
    pub fn broadcast(&mut self, value: Option<u64>) -> Result<u64, CoordError> {
        let value = self.transport.broadcast(value.map(Scalar::Count))?;
        value.as_count().ok_or_else(|| self.kind_error("broadcast", value))
    }

    pub fn broadcast_real(&mut self, value: Option<f64>) -> Result<f64, CoordError> {
        let value = self.transport.broadcast(value.map(Scalar::Real))?;
        value.as_real().ok_or_else(|| self.kind_error("broadcast", value))
    }

    /// Global minimum, identical on every rank
    pub fn all_min(&mut self, value: u64) -> Result<u64, CoordError> {
        let reduced = self.reduce_min(value)?;
        let global = self.broadcast(reduced)?;
        trace!(rank = self.identity.rank, local = value, global, "Collectives::all_min");
        Ok(global)
    }

    /// Global sum, identical on every rank
    pub fn all_sum(&mut self, value: u64) -> Result<u64, CoordError> {
        let reduced = self.reduce_sum(value)?;
        self.broadcast(reduced)
    }

    /// Global floating-point sum, identical on every rank
    pub fn all_sum_real(&mut self, value: f64) -> Result<f64, CoordError> {
        let reduced = self.reduce_sum_real(value)?;
        self.broadcast_real(reduced)
    }

    fn expect_count(&self, value: Option<Scalar>, op: &str) -> Result<Option<u64>, CoordError> {
        match value {
            None => Ok(None),
            Some(Scalar::Count(v)) => Ok(Some(v)),
            Some(other) => Err(self.kind_error(op, other)),
        }
    }

    fn kind_error(&self, op: &str, got: Scalar) -> CoordError {
        CoordError::collective(op, self.identity.rank, format!("mismatched call sequence: unexpected {:?}", got))
    }
}
