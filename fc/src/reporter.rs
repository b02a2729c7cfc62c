//! Leader-only progress reporting
//!
//! Purely observational: the reporter reads the clock and energy state and
//! writes human-readable lines. It never feeds anything back into the
//! coordination path except the wish for an energy sample, which the
//! lifecycle folds into the regular sample vote.

use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::energy::EnergyState;
use crate::negotiator::SimulationClock;

/// Fixed wall-clock cadence
#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    last: Instant,
}

impl Cadence {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self { interval, last: start }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Due once the interval has been exceeded; a zero interval is always due
    pub fn is_due(&self, now: Instant) -> bool {
        self.interval.is_zero() || now.saturating_duration_since(self.last) > self.interval
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = now;
    }
}

/// Format elapsed time as HH:MM:SS (hours may exceed 24)
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let mins = secs / 60;
    let hours = mins / 60;
    format!("{:02}:{:02}:{:02}", hours, mins % 60, secs % 60)
}

/// Cells per second in millions; 0 when nothing can be measured
fn mcells_per_sec(cells: u64, steps: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || steps == 0 {
        return 0.0;
    }
    cells as f64 / 1e6 * steps as f64 / secs
}

/// One progress report
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub elapsed: Duration,
    pub timestep: u64,
    pub percent: f64,
    pub mcells_per_sec: f64,
    pub secs_per_step: f64,
    pub energy: f64,
    pub decay_db: f64,
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[@{}] Timestep: {:>12} ({:>6.2}%) || Speed: {:>6.1} MC/s ({:.3e} s/TS) || Energy: ~{:.2e} (-{:>5.2}dB)",
            format_elapsed(self.elapsed),
            self.timestep,
            self.percent,
            self.mcells_per_sec,
            self.secs_per_step,
            self.energy,
            self.decay_db.abs(),
        )
    }
}

/// Aggregate statistics emitted once at the end of a run
#[derive(Debug, Clone, PartialEq)]
pub struct FinalStats {
    pub elapsed: Duration,
    pub timesteps: u64,
    pub global_cells: u64,
    pub mcells_per_sec: f64,
}

impl FinalStats {
    pub fn new(elapsed: Duration, timesteps: u64, global_cells: u64) -> Self {
        Self {
            elapsed,
            timesteps,
            global_cells,
            mcells_per_sec: mcells_per_sec(global_cells, timesteps, elapsed),
        }
    }
}

impl fmt::Display for FinalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Time for {} iterations with {} cells : {:.3} sec",
            self.timesteps,
            self.global_cells,
            self.elapsed.as_secs_f64()
        )?;
        write!(f, "Speed: {:.2} MCells/s", self.mcells_per_sec)
    }
}

/// Periodic throughput/decay reporter, constructed on the leader only
pub struct ProgressReporter {
    cadence: Cadence,
    start: Instant,
    prev_time: Instant,
    prev_timestep: u64,
    global_cells: u64,
    out: Box<dyn Write + Send>,
    reports: u64,
}

impl ProgressReporter {
    pub fn new(interval: Duration, global_cells: u64, start: Instant, out: Box<dyn Write + Send>) -> Self {
        Self {
            cadence: Cadence::new(interval, start),
            start,
            prev_time: start,
            prev_timestep: 0,
            global_cells,
            out,
            reports: 0,
        }
    }

    /// Reporter writing to stdout
    pub fn stdout(interval: Duration, global_cells: u64, start: Instant) -> Self {
        Self::new(interval, global_cells, start, Box::new(io::stdout()))
    }

    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.cadence.is_due(now)
    }

    /// Write one progress line and restart the interval
    pub fn report(&mut self, now: Instant, clock: &SimulationClock, energy: &EnergyState) -> io::Result<ProgressLine> {
        let elapsed_since_prev = now.saturating_duration_since(self.prev_time);
        let steps = clock.current().saturating_sub(self.prev_timestep);

        let line = ProgressLine {
            elapsed: now.saturating_duration_since(self.start),
            timestep: clock.current(),
            percent: clock.progress_percent(),
            mcells_per_sec: mcells_per_sec(self.global_cells, steps, elapsed_since_prev),
            secs_per_step: if steps > 0 {
                elapsed_since_prev.as_secs_f64() / steps as f64
            } else {
                0.0
            },
            energy: energy.current(),
            decay_db: energy.decay_db(),
        };

        writeln!(self.out, "{}", line)?;
        self.out.flush()?;
        trace!(timestep = line.timestep, "ProgressReporter::report: written");

        self.prev_time = now;
        self.prev_timestep = clock.current();
        self.cadence.mark(now);
        self.reports += 1;
        Ok(line)
    }

    /// Write the final aggregate statistics
    pub fn finish(&mut self, now: Instant, timesteps: u64) -> io::Result<FinalStats> {
        let stats = FinalStats::new(now.saturating_duration_since(self.start), timesteps, self.global_cells);
        writeln!(self.out, "{}", stats)?;
        self.out.flush()?;
        Ok(stats)
    }
}
