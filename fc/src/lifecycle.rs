//! Run lifecycle: INIT -> RUNNING -> DRAINING -> DONE
//!
//! The [`Coordinator`] owns every piece of replicated state for one rank
//! (clock, energy, negotiation rounds) and drives the engine and pipeline
//! through the phases. Phase transitions depend only on the negotiated
//! burst, which is identical on every rank, so all ranks move in lockstep.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::collective::Collectives;
use crate::config::Config;
use crate::energy::{EnergyMonitor, EnergyState};
use crate::engine::{Engine, FieldPipeline};
use crate::error::CoordError;
use crate::negotiator::{SimulationClock, StepNegotiator};
use crate::reporter::{Cadence, FinalStats, ProgressReporter};
use crate::transport::{RankIdentity, Transport};

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Draining,
    Done,
}

impl Phase {
    /// Next phase given the most recently negotiated burst
    pub fn next(self, burst: u64) -> Phase {
        match self {
            Phase::Init => Phase::Running,
            Phase::Running if burst == 0 => Phase::Draining,
            Phase::Running => Phase::Running,
            Phase::Draining | Phase::Done => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Running => "RUNNING",
            Phase::Draining => "DRAINING",
            Phase::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// Why the run stopped, derived from replicated state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted,
    Converged,
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::BudgetExhausted => write!(f, "timestep budget exhausted"),
            StopReason::Converged => write!(f, "energy decay reached end criteria"),
            StopReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Local abort request: a signal handler flag or a sentinel file
///
/// Observing it only changes this rank's burst proposal to 0; the stop
/// itself reaches every rank through negotiation.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    requested: Arc<AtomicBool>,
    sentinel: Option<PathBuf>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat the existence of `path` as an abort request
    pub fn with_sentinel(mut self, path: impl Into<PathBuf>) -> Self {
        self.sentinel = Some(path.into());
        self
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        if self.requested.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.sentinel
            && path.exists()
        {
            self.requested.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// Outcome of a completed run on one rank
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub identity: RankIdentity,
    pub timesteps: u64,
    pub global_cells: u64,
    pub rounds: u64,
    pub energy: EnergyState,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
    /// Leader only
    pub stats: Option<FinalStats>,
    /// Progress lines written (leader only)
    pub reports: u64,
}

/// Per-rank coordinator holding all replicated state
pub struct Coordinator<T: Transport> {
    collectives: Collectives<T>,
    clock: SimulationClock,
    negotiator: StepNegotiator,
    monitor: EnergyMonitor,
    abort: AbortSignal,
    abort_seen: bool,
    report_interval: Duration,
    report_out: Option<Box<dyn Write + Send>>,
    reporter: Option<ProgressReporter>,
    flush: Cadence,
    global_cells: u64,
    start: Instant,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, config: &Config) -> Self {
        let start = Instant::now();
        Self {
            collectives: Collectives::new(transport),
            clock: SimulationClock::new(config.simulation.num_timesteps),
            negotiator: StepNegotiator::new(),
            monitor: EnergyMonitor::new(config.simulation.end_criteria_db),
            abort: AbortSignal::new(),
            abort_seen: false,
            report_interval: config.reporting.interval(),
            report_out: None,
            reporter: None,
            flush: Cadence::new(config.reporting.flush_interval(), start),
            global_cells: 0,
            start,
        }
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Write leader progress to `out` instead of stdout
    pub fn with_report_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.report_out = Some(out);
        self
    }

    pub fn identity(&self) -> RankIdentity {
        self.collectives.identity()
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn energy(&self) -> &EnergyState {
        self.monitor.state()
    }

    /// Drive the run to DONE
    ///
    /// Any collective failure is returned immediately; the caller must treat
    /// it as fatal for the whole run.
    pub fn run<E: Engine, P: FieldPipeline>(
        &mut self,
        engine: &mut E,
        pipeline: &mut P,
    ) -> Result<RunSummary, CoordError> {
        let rank = self.identity();
        let mut phase = Phase::Init;
        let mut burst = 0;

        while phase != Phase::Done {
            match phase {
                Phase::Init => self.initialize(engine, pipeline)?,
                Phase::Running => burst = self.cycle(engine, pipeline)?,
                Phase::Draining => {
                    pipeline.flush_pending()?;
                    pipeline.postprocess()?;
                }
                Phase::Done => {}
            }
            let next = phase.next(burst);
            if next != phase {
                info!(%rank, from = %phase, to = %next, timestep = self.clock.current(), "Lifecycle transition");
            }
            phase = next;
        }

        Ok(self.finish())
    }

    fn initialize<E: Engine, P: FieldPipeline>(&mut self, engine: &mut E, pipeline: &mut P) -> Result<(), CoordError> {
        let local_cells = engine.local_cell_count();
        self.global_cells = self.collectives.all_sum(local_cells)?;
        debug!(local_cells, global_cells = self.global_cells, "Coordinator::initialize: cell count");

        for checkpoint in engine.excitation_checkpoints() {
            pipeline.add_scheduled_checkpoint(checkpoint);
        }
        pipeline.preprocess()?;

        self.start = Instant::now();
        self.flush.mark(self.start);
        self.clock.observe(engine.current_timestep());

        if self.identity().is_leader() {
            let reporter = match self.report_out.take() {
                Some(out) => ProgressReporter::new(self.report_interval, self.global_cells, self.start, out),
                None => ProgressReporter::stdout(self.report_interval, self.global_cells, self.start),
            };
            self.reporter = Some(reporter);
        }
        Ok(())
    }

    /// One RUNNING cycle; returns the negotiated burst
    fn cycle<E: Engine, P: FieldPipeline>(&mut self, engine: &mut E, pipeline: &mut P) -> Result<u64, CoordError> {
        let proposal = self.local_proposal(pipeline);
        let burst = self.negotiator.negotiate(&mut self.collectives, proposal, &mut self.clock)?;
        if burst == 0 {
            return Ok(0);
        }

        engine.advance_by(burst);
        self.clock.observe(engine.current_timestep());
        let timestep = self.clock.current();
        let now = Instant::now();

        let report_due = self.reporter.as_ref().is_some_and(|r| r.is_due(now));
        let requests = u64::from(pipeline.requests_energy_sample_now(timestep)) + u64::from(report_due);
        if self.monitor.should_sample(&mut self.collectives, requests)? {
            let local_energy = pipeline.local_partial_energy(timestep, &*engine);
            self.monitor.sample(&mut self.collectives, local_energy)?;
        }

        if report_due && let Some(reporter) = self.reporter.as_mut() {
            if let Err(e) = reporter.report(now, &self.clock, self.monitor.state()) {
                warn!(error = %e, "Failed to write progress report");
            }
        }

        if self.flush.is_due(now) {
            pipeline.flush_pending()?;
            self.flush.mark(now);
        }
        Ok(burst)
    }

    fn local_proposal<P: FieldPipeline>(&mut self, pipeline: &mut P) -> u64 {
        if self.abort.is_requested() {
            if !self.abort_seen {
                warn!(rank = %self.identity(), "Abort requested, proposing zero burst");
                self.abort_seen = true;
            }
            return 0;
        }
        if self.monitor.is_converged() {
            return 0;
        }
        let proposal = pipeline.propose_next_checkpoint(self.clock.current());
        StepNegotiator::clip(proposal, self.clock.remaining())
    }

    fn stop_reason(&self) -> StopReason {
        if self.clock.remaining() == 0 {
            StopReason::BudgetExhausted
        } else if self.monitor.meets_threshold() {
            StopReason::Converged
        } else {
            StopReason::Interrupted
        }
    }

    fn finish(&mut self) -> RunSummary {
        let now = Instant::now();
        let stop_reason = self.stop_reason();
        let timesteps = self.clock.current();

        let stats = self
            .reporter
            .as_mut()
            .and_then(|reporter| match reporter.finish(now, timesteps) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Failed to write final statistics");
                    None
                }
            });

        info!(
            rank = %self.identity(),
            timesteps,
            rounds = self.negotiator.rounds(),
            reason = %stop_reason,
            "Run complete"
        );

        RunSummary {
            identity: self.identity(),
            timesteps,
            global_cells: self.global_cells,
            rounds: self.negotiator.rounds(),
            energy: self.monitor.state().clone(),
            stop_reason,
            elapsed: now.saturating_duration_since(self.start),
            stats,
            reports: self.reporter.as_ref().map_or(0, |r| r.reports()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FieldSource;
    use crate::transport::SoloTransport;
    use std::io;
    use tempfile::TempDir;

    struct Counter {
        timestep: u64,
        energy: f64,
    }

    impl FieldSource for Counter {
        fn local_field_energy(&self) -> f64 {
            self.energy
        }
    }

    impl Engine for Counter {
        fn advance_by(&mut self, steps: u64) {
            self.timestep += steps;
        }

        fn current_timestep(&self) -> u64 {
            self.timestep
        }

        fn local_cell_count(&self) -> u64 {
            1000
        }
    }

    /// Fixed-stride pipeline that never samples
    struct Stride(u64);

    impl FieldPipeline for Stride {
        fn propose_next_checkpoint(&mut self, _timestep: u64) -> Option<u64> {
            Some(self.0)
        }

        fn requests_energy_sample_now(&self, _timestep: u64) -> bool {
            false
        }

        fn local_partial_energy(&mut self, _timestep: u64, fields: &dyn FieldSource) -> f64 {
            fields.local_field_energy()
        }

        fn add_scheduled_checkpoint(&mut self, _timestep: u64) {}
    }

    fn config(budget: u64) -> Config {
        let mut config = Config::default();
        config.simulation.num_timesteps = budget;
        config.reporting.interval_ms = 3_600_000;
        config
    }

    #[test]
    fn test_phase_transitions() {
        assert_eq!(Phase::Init.next(0), Phase::Running);
        assert_eq!(Phase::Running.next(5), Phase::Running);
        assert_eq!(Phase::Running.next(0), Phase::Draining);
        assert_eq!(Phase::Draining.next(5), Phase::Done);
        assert_eq!(Phase::Done.next(0), Phase::Done);
    }

    #[test]
    fn test_solo_run_exhausts_budget() {
        let mut engine = Counter { timestep: 0, energy: 1.0 };
        let mut pipeline = Stride(30);
        let mut coordinator = Coordinator::new(SoloTransport, &config(100)).with_report_output(Box::new(io::sink()));

        let summary = coordinator.run(&mut engine, &mut pipeline).unwrap();
        assert_eq!(summary.timesteps, 100);
        assert_eq!(engine.timestep, 100);
        assert_eq!(summary.stop_reason, StopReason::BudgetExhausted);
        // 30, 30, 30, 10, then 0
        assert_eq!(summary.rounds, 5);
        assert_eq!(summary.global_cells, 1000);
        assert!(summary.stats.is_some());
        assert_eq!(summary.energy.samples(), 0);
        assert_eq!(coordinator.clock().current(), 100);
        assert_eq!(coordinator.clock().budget(), 100);
    }

    #[test]
    fn test_abort_flag_stops_before_advancing() {
        let abort = AbortSignal::new();
        abort.request();
        let mut engine = Counter { timestep: 0, energy: 1.0 };
        let mut coordinator = Coordinator::new(SoloTransport, &config(100))
            .with_abort(abort)
            .with_report_output(Box::new(io::sink()));

        let summary = coordinator.run(&mut engine, &mut Stride(10)).unwrap();
        assert_eq!(summary.timesteps, 0);
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
    }

    #[test]
    fn test_abort_sentinel_file() {
        let temp = TempDir::new().unwrap();
        let sentinel = temp.path().join("ABORT");
        let abort = AbortSignal::new().with_sentinel(&sentinel);
        assert!(!abort.is_requested());

        std::fs::write(&sentinel, "").unwrap();
        assert!(abort.is_requested());
        std::fs::remove_file(&sentinel).unwrap();
        assert!(abort.is_requested(), "abort request latches");
    }

    #[test]
    fn test_report_forces_energy_sample() {
        let mut config = config(50);
        config.reporting.interval_ms = 0;
        let mut engine = Counter { timestep: 0, energy: 2.0 };
        let mut coordinator = Coordinator::new(SoloTransport, &config).with_report_output(Box::new(io::sink()));

        let summary = coordinator.run(&mut engine, &mut Stride(10)).unwrap();
        assert_eq!(summary.reports, 5);
        assert_eq!(summary.energy.samples(), 5);
        assert_eq!(summary.energy.current(), 2.0);
        assert_eq!(coordinator.energy(), &summary.energy);
    }
}
