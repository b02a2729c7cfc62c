//! Field-processing pipeline with an energy probe
//!
//! The probe decides which timesteps need a global energy estimate:
//! explicitly scheduled checkpoints (excitation end, for instance) plus an
//! optional periodic interval. Recorded partial energies can be traced to a
//! JSON-lines file, written out on flush.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::{FieldPipeline, FieldSource};
use crate::error::CoordError;

/// Timesteps at which an energy sample is wanted
#[derive(Debug, Clone, Default)]
pub struct EnergyProbe {
    scheduled: BTreeSet<u64>,
    interval: u64,
}

impl EnergyProbe {
    /// `interval` of 0 disables periodic sampling
    pub fn new(interval: u64) -> Self {
        Self {
            scheduled: BTreeSet::new(),
            interval,
        }
    }

    pub fn schedule(&mut self, timestep: u64) {
        self.scheduled.insert(timestep);
    }

    pub fn scheduled(&self) -> impl Iterator<Item = u64> + '_ {
        self.scheduled.iter().copied()
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn is_due(&self, timestep: u64) -> bool {
        self.scheduled.contains(&timestep)
            || (self.interval > 0 && timestep > 0 && timestep % self.interval == 0)
    }

    /// Steps from `timestep` to the next due timestep, if any
    pub fn steps_to_next(&self, timestep: u64) -> Option<u64> {
        let scheduled = self
            .scheduled
            .range(timestep.saturating_add(1)..)
            .next()
            .map(|ts| ts - timestep);
        let periodic = (self.interval > 0).then(|| self.interval - timestep % self.interval);

        match (scheduled, periodic) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// One traced energy sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyRecord {
    pub timestep: u64,
    #[serde(rename = "local-energy")]
    pub local_energy: f64,
}

/// Default pipeline: energy probe plus an optional per-rank trace
pub struct ProcessingArray {
    probe: EnergyProbe,
    max_burst: u64,
    trace: Option<BufWriter<File>>,
    pending: Vec<EnergyRecord>,
    show_probe_discretization: bool,
}

impl ProcessingArray {
    pub fn new(max_burst: u64, sample_interval: u64) -> Self {
        Self {
            probe: EnergyProbe::new(sample_interval),
            max_burst: max_burst.max(1),
            trace: None,
            pending: Vec::new(),
            show_probe_discretization: false,
        }
    }

    /// Trace recorded samples to `path` as JSON lines
    pub fn with_trace(mut self, path: &Path) -> Result<Self, CoordError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        self.trace = Some(BufWriter::new(File::create(path)?));
        Ok(self)
    }

    pub fn show_probe_discretization(mut self, show: bool) -> Self {
        self.show_probe_discretization = show;
        self
    }

    pub fn probe(&self) -> &EnergyProbe {
        &self.probe
    }

    /// Records waiting for the next flush
    pub fn pending(&self) -> &[EnergyRecord] {
        &self.pending
    }
}

impl FieldPipeline for ProcessingArray {
    fn preprocess(&mut self) -> Result<(), CoordError> {
        let scheduled: Vec<u64> = self.probe.scheduled().collect();
        debug!(?scheduled, interval = self.probe.interval(), "ProcessingArray::preprocess");
        if self.show_probe_discretization {
            println!("Energy probe checkpoints: {:?}", scheduled);
            println!("Energy probe interval: {} timesteps", self.probe.interval());
        }
        Ok(())
    }

    fn postprocess(&mut self) -> Result<(), CoordError> {
        self.flush_pending()?;
        if let Some(mut trace) = self.trace.take() {
            trace.flush()?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), CoordError> {
        let Some(trace) = self.trace.as_mut() else {
            self.pending.clear();
            return Ok(());
        };
        for record in self.pending.drain(..) {
            serde_json::to_writer(&mut *trace, &record)?;
            trace.write_all(b"\n")?;
        }
        trace.flush()?;
        Ok(())
    }

    fn propose_next_checkpoint(&mut self, timestep: u64) -> Option<u64> {
        let next = self.probe.steps_to_next(timestep).unwrap_or(self.max_burst);
        Some(next.clamp(1, self.max_burst))
    }

    fn requests_energy_sample_now(&self, timestep: u64) -> bool {
        self.probe.is_due(timestep)
    }

    fn local_partial_energy(&mut self, timestep: u64, fields: &dyn FieldSource) -> f64 {
        let local_energy = fields.local_field_energy();
        self.pending.push(EnergyRecord { timestep, local_energy });
        local_energy
    }

    fn add_scheduled_checkpoint(&mut self, timestep: u64) {
        info!(timestep, "Scheduled energy checkpoint");
        self.probe.schedule(timestep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixed(f64);

    impl FieldSource for Fixed {
        fn local_field_energy(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_probe_due() {
        let mut probe = EnergyProbe::new(100);
        probe.schedule(42);
        assert!(probe.is_due(42));
        assert!(probe.is_due(200));
        assert!(!probe.is_due(0));
        assert!(!probe.is_due(150));

        let disabled = EnergyProbe::new(0);
        assert!(!disabled.is_due(100));
    }

    #[test]
    fn test_steps_to_next() {
        let mut probe = EnergyProbe::new(100);
        probe.schedule(42);
        assert_eq!(probe.steps_to_next(0), Some(42));
        assert_eq!(probe.steps_to_next(42), Some(58));
        assert_eq!(probe.steps_to_next(100), Some(100));

        let mut sparse = EnergyProbe::new(0);
        assert_eq!(sparse.steps_to_next(5), None);
        sparse.schedule(10);
        assert_eq!(sparse.steps_to_next(5), Some(5));
        assert_eq!(sparse.steps_to_next(10), None);
    }

    #[test]
    fn test_proposal_bounded_by_max_burst() {
        let mut pa = ProcessingArray::new(50, 0);
        assert_eq!(pa.propose_next_checkpoint(0), Some(50));

        pa.add_scheduled_checkpoint(30);
        assert_eq!(pa.probe().scheduled().collect::<Vec<_>>(), vec![30]);
        assert_eq!(pa.probe().interval(), 0);
        assert_eq!(pa.propose_next_checkpoint(0), Some(30));
        assert_eq!(pa.propose_next_checkpoint(29), Some(1));
        assert_eq!(pa.propose_next_checkpoint(30), Some(50));
    }

    #[test]
    fn test_trace_written_on_flush() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("traces").join("rank0.jsonl");
        let mut pa = ProcessingArray::new(10, 10).with_trace(&path).unwrap();

        assert_eq!(pa.local_partial_energy(10, &Fixed(2.5)), 2.5);
        assert_eq!(pa.local_partial_energy(20, &Fixed(0.5)), 0.5);
        assert_eq!(pa.pending().len(), 2);

        pa.flush_pending().unwrap();
        assert!(pa.pending().is_empty());
        pa.postprocess().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"timestep":10,"local-energy":2.5}"#);
    }

    #[test]
    fn test_flush_without_trace_drops_records() {
        let mut pa = ProcessingArray::new(10, 0);
        pa.local_partial_energy(1, &Fixed(1.0));
        pa.flush_pending().unwrap();
        assert!(pa.pending().is_empty());
    }
}
