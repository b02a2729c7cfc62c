//! Scripted engine and pipeline for driving the coordinator in tests

#![allow(dead_code)]

use std::io;
use std::thread;
use std::time::Duration;

use fdtdcoord::config::Config;
use fdtdcoord::engine::{Engine, FieldPipeline, FieldSource};
use fdtdcoord::error::CoordError;
use fdtdcoord::lifecycle::{AbortSignal, Coordinator, RunSummary};
use fdtdcoord::transport::LocalGroup;

/// Engine that only counts timesteps and records every burst
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    pub timestep: u64,
    pub cells: u64,
    pub bursts: Vec<u64>,
    pub checkpoints: Vec<u64>,
}

impl ScriptedEngine {
    pub fn new(cells: u64) -> Self {
        Self {
            cells,
            ..Self::default()
        }
    }
}

impl FieldSource for ScriptedEngine {
    fn local_field_energy(&self) -> f64 {
        0.0
    }
}

impl Engine for ScriptedEngine {
    fn advance_by(&mut self, steps: u64) {
        self.timestep += steps;
        self.bursts.push(steps);
    }

    fn current_timestep(&self) -> u64 {
        self.timestep
    }

    fn local_cell_count(&self) -> u64 {
        self.cells
    }

    fn excitation_checkpoints(&self) -> Vec<u64> {
        self.checkpoints.clone()
    }
}

/// Pipeline with a fixed stride and a scripted energy sequence
#[derive(Debug, Default)]
pub struct ScriptedPipeline {
    pub stride: u64,
    /// Request a sample after every burst
    pub sample_every_burst: bool,
    /// Partial energies returned in order; the last one repeats
    pub energies: Vec<f64>,
    pub samples_taken: usize,
    pub scheduled: Vec<u64>,
    /// Request an abort once this timestep is reached
    pub abort_at: Option<(u64, AbortSignal)>,
    pub preprocessed: bool,
    pub postprocessed: bool,
    pub flushes: usize,
}

impl ScriptedPipeline {
    pub fn new(stride: u64) -> Self {
        Self {
            stride,
            ..Self::default()
        }
    }

    pub fn sampling(mut self, energies: Vec<f64>) -> Self {
        self.sample_every_burst = true;
        self.energies = energies;
        self
    }
}

impl FieldPipeline for ScriptedPipeline {
    fn preprocess(&mut self) -> Result<(), CoordError> {
        self.preprocessed = true;
        Ok(())
    }

    fn postprocess(&mut self) -> Result<(), CoordError> {
        self.postprocessed = true;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), CoordError> {
        self.flushes += 1;
        Ok(())
    }

    fn propose_next_checkpoint(&mut self, timestep: u64) -> Option<u64> {
        if let Some((at, abort)) = &self.abort_at
            && timestep >= *at
        {
            abort.request();
        }
        Some(self.stride)
    }

    fn requests_energy_sample_now(&self, timestep: u64) -> bool {
        self.sample_every_burst || self.scheduled.contains(&timestep)
    }

    fn local_partial_energy(&mut self, _timestep: u64, _fields: &dyn FieldSource) -> f64 {
        let energy = self
            .energies
            .get(self.samples_taken)
            .or(self.energies.last())
            .copied()
            .unwrap_or(0.0);
        self.samples_taken += 1;
        energy
    }

    fn add_scheduled_checkpoint(&mut self, timestep: u64) {
        self.scheduled.push(timestep);
    }
}

/// Config with a budget, a threshold and reporting effectively disabled
pub fn config(budget: u64, end_criteria_db: f64) -> Config {
    let mut config = Config::default();
    config.simulation.num_timesteps = budget;
    config.simulation.end_criteria_db = end_criteria_db;
    config.reporting.interval_ms = 3_600_000;
    config
}

/// Result of one simulated rank
pub struct RankOutcome {
    pub summary: Result<RunSummary, CoordError>,
    pub engine: ScriptedEngine,
    pub pipeline: ScriptedPipeline,
}

/// Run one coordinator per rank on its own thread over an in-process group
///
/// `setup` builds each rank's engine, pipeline and abort signal from its rank.
pub fn run_group<F>(size: usize, config: &Config, setup: F) -> Vec<RankOutcome>
where
    F: Fn(usize) -> (ScriptedEngine, ScriptedPipeline, AbortSignal),
{
    let group = LocalGroup::form(size, Some(Duration::from_secs(10))).expect("group forms");

    let handles: Vec<_> = group
        .into_iter()
        .enumerate()
        .map(|(rank, transport)| {
            let (mut engine, mut pipeline, abort) = setup(rank);
            let config = config.clone();
            thread::spawn(move || {
                let mut coordinator = Coordinator::new(transport, &config)
                    .with_abort(abort)
                    .with_report_output(Box::new(io::sink()));
                let summary = coordinator.run(&mut engine, &mut pipeline);
                RankOutcome {
                    summary,
                    engine,
                    pipeline,
                }
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}
