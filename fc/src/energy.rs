//! Global energy convergence monitoring
//!
//! Each rank contributes its local partial field energy; the sum is the
//! global energy every rank observes. The decay ratio against the largest
//! energy seen so far is the convergence signal. Only the leader turns that
//! signal into a decision, and the decision travels to the other ranks as a
//! zero burst proposal (see [`crate::negotiator`]).

use tracing::{debug, info, warn};

use crate::collective::Collectives;
use crate::error::CoordError;
use crate::transport::Transport;

/// Convert an energy ratio to decibels
pub fn ratio_to_db(ratio: f64) -> f64 {
    10.0 * ratio.log10()
}

/// Replicated energy bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyState {
    current: f64,
    max: f64,
    decay_ratio: f64,
    samples: u64,
}

impl Default for EnergyState {
    fn default() -> Self {
        Self {
            current: 0.0,
            max: 0.0,
            decay_ratio: 1.0,
            samples: 0,
        }
    }
}

impl EnergyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known maximum (resumed runs, tests)
    pub fn with_max(max: f64) -> Self {
        Self { max, ..Self::default() }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// current / max; 1.0 until a positive maximum exists
    pub fn decay_ratio(&self) -> f64 {
        self.decay_ratio
    }

    /// Decay in dB (<= 0)
    pub fn decay_db(&self) -> f64 {
        ratio_to_db(self.decay_ratio)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Fold in a new global energy sample
    pub fn record(&mut self, energy: f64) {
        if !energy.is_finite() || energy < 0.0 {
            warn!(energy, "EnergyState::record: non-physical energy sample");
        }
        self.current = energy;
        if energy > self.max {
            self.max = energy;
        }
        if self.max > 0.0 {
            self.decay_ratio = energy / self.max;
        }
        self.samples += 1;
    }
}

/// Aggregates partial energies and decides convergence
#[derive(Debug)]
pub struct EnergyMonitor {
    state: EnergyState,
    threshold_db: f64,
    converged: bool,
}

impl EnergyMonitor {
    /// `threshold_db` is the decay magnitude (positive dB) that ends the run;
    /// 0 disables convergence termination
    pub fn new(threshold_db: f64) -> Self {
        Self::with_state(threshold_db, EnergyState::new())
    }

    pub fn with_state(threshold_db: f64, state: EnergyState) -> Self {
        Self {
            state,
            threshold_db,
            converged: false,
        }
    }

    pub fn state(&self) -> &EnergyState {
        &self.state
    }

    pub fn threshold_db(&self) -> f64 {
        self.threshold_db
    }

    /// Whether the leader has decided the run converged
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Whether the replicated decay has crossed the threshold
    ///
    /// Every rank computes the same answer from the same replicated state;
    /// only the leader acts on it. Always false when the threshold is 0.
    pub fn meets_threshold(&self) -> bool {
        self.threshold_db > 0.0 && self.state.max() > 0.0 && self.state.decay_db().abs() >= self.threshold_db
    }

    /// Does any rank want an energy sample at this timestep?
    ///
    /// `local_requests` is this rank's request count; the group answer is
    /// true when the global sum is positive.
    pub fn should_sample<T: Transport>(
        &self,
        collectives: &mut Collectives<T>,
        local_requests: u64,
    ) -> Result<bool, CoordError> {
        let total = collectives.all_sum(local_requests)?;
        Ok(total > 0)
    }

    /// Sum the partial energies, update the replicated state and, on the
    /// leader, re-evaluate convergence
    pub fn sample<T: Transport>(
        &mut self,
        collectives: &mut Collectives<T>,
        local_energy: f64,
    ) -> Result<f64, CoordError> {
        let global = collectives.all_sum_real(local_energy)?;
        self.state.record(global);

        debug!(
            rank = collectives.identity().rank,
            local_energy,
            global,
            max = self.state.max(),
            decay_db = self.state.decay_db(),
            "EnergyMonitor::sample: recorded"
        );

        if collectives.identity().is_leader() && !self.converged && self.meets_threshold() {
            info!(
                decay_db = self.state.decay_db(),
                threshold_db = self.threshold_db,
                sample = self.state.samples(),
                "Energy decay reached end criteria"
            );
            self.converged = true;
        }
        Ok(global)
    }
}
