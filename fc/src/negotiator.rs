//! Burst-size negotiation
//!
//! Every rank proposes how many timesteps it can safely advance; the group
//! advances by the smallest proposal, clipped to the remaining budget. A
//! proposal of 0 from any rank therefore stops every rank.

use tracing::debug;

use crate::collective::Collectives;
use crate::error::CoordError;
use crate::transport::Transport;

/// Timestep bookkeeping, replicated on every rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationClock {
    /// Total timestep budget, fixed at init
    budget: u64,
    /// Last timestep count reported by the engine
    current: u64,
    /// Most recently negotiated burst
    burst: u64,
}

impl SimulationClock {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            current: 0,
            burst: 0,
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.current)
    }

    /// Sync with the engine's timestep counter
    pub fn observe(&mut self, current: u64) {
        debug_assert!(current >= self.current, "engine timestep count went backwards");
        self.current = current;
    }

    /// Percentage of the budget completed
    pub fn progress_percent(&self) -> f64 {
        if self.budget == 0 {
            return 100.0;
        }
        self.current as f64 / self.budget as f64 * 100.0
    }
}

/// Computes the globally agreed burst length
#[derive(Debug, Default)]
pub struct StepNegotiator {
    rounds: u64,
}

impl StepNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of negotiation rounds completed
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Bound a local proposal by the remaining budget
    ///
    /// `None` means the pipeline has no checkpoint pending, so the rank is
    /// limited by the budget alone.
    pub fn clip(proposal: Option<u64>, remaining: u64) -> u64 {
        proposal.map_or(remaining, |p| p.min(remaining))
    }

    /// Agree on the next burst and record it in `clock`
    pub fn negotiate<T: Transport>(
        &mut self,
        collectives: &mut Collectives<T>,
        local_proposal: u64,
        clock: &mut SimulationClock,
    ) -> Result<u64, CoordError> {
        let local = local_proposal.min(clock.remaining());
        let burst = collectives.all_min(local)?;
        self.rounds += 1;
        clock.burst = burst;
        debug!(round = self.rounds, local, burst, "StepNegotiator::negotiate: agreed");
        Ok(burst)
    }
}
