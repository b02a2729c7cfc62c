//! Contracts consumed from the field engine and processing pipeline
//!
//! The coordinator never touches field data directly. It drives an
//! [`Engine`] forward in bursts and asks the [`FieldPipeline`] when the next
//! checkpoint is, whether it wants an energy estimate now, and what the
//! local share of the field energy is.

use crate::error::CoordError;

/// Read access to the local subdomain's fields
pub trait FieldSource {
    /// Total electromagnetic energy stored in the local subdomain
    fn local_field_energy(&self) -> f64;
}

/// Per-rank field update engine
pub trait Engine: FieldSource {
    /// Advance exactly `steps` timesteps
    fn advance_by(&mut self, steps: u64);

    /// Timesteps processed since the start of the run
    fn current_timestep(&self) -> u64;

    /// Number of cells in the local subdomain
    fn local_cell_count(&self) -> u64;

    /// Timesteps at which the excitation has fully entered the domain
    ///
    /// Energy samples scheduled here give the decay measurement a
    /// meaningful starting point.
    fn excitation_checkpoints(&self) -> Vec<u64> {
        Vec::new()
    }
}

/// Field-processing pipeline (probes, dumps, energy estimator)
pub trait FieldPipeline {
    fn preprocess(&mut self) -> Result<(), CoordError> {
        Ok(())
    }

    fn postprocess(&mut self) -> Result<(), CoordError> {
        Ok(())
    }

    /// Write out anything buffered so far
    fn flush_pending(&mut self) -> Result<(), CoordError> {
        Ok(())
    }

    /// Run processings due at `timestep` and return the number of steps
    /// until one is needed again; `None` means no checkpoint is pending
    fn propose_next_checkpoint(&mut self, timestep: u64) -> Option<u64>;

    /// Whether this rank wants an energy estimate at `timestep`
    fn requests_energy_sample_now(&self, timestep: u64) -> bool;

    /// Local partial field energy, as seen by the pipeline's energy probe
    fn local_partial_energy(&mut self, timestep: u64, fields: &dyn FieldSource) -> f64;

    /// Schedule an energy checkpoint at an absolute timestep
    fn add_scheduled_checkpoint(&mut self, timestep: u64);
}
