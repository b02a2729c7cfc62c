//! Built-in 1-D lossy slab engine
//!
//! A Yee-staggered Ez/Hy line with perfectly conducting ends and soft
//! Gaussian sources. Each rank owns an independent slab; the coordinator
//! only needs the engine to advance, count cells and report energy.

use tracing::trace;

use crate::config::{GridConfig, SourceConfig};
use crate::engine::{Engine, FieldSource};

/// Gaussian pulses span this many widths
const PULSE_SPAN: u64 = 8;

struct Source {
    position: usize,
    delay: u64,
    width: u64,
    amplitude: f64,
}

impl Source {
    fn from_config(config: &SourceConfig) -> Self {
        Self {
            position: config.position,
            delay: config.delay,
            width: config.width.max(1),
            amplitude: config.amplitude,
        }
    }

    /// Amplitude injected at `timestep`; zero outside the pulse window
    fn value(&self, timestep: u64) -> f64 {
        if timestep < self.delay || timestep > self.delay + PULSE_SPAN * self.width {
            return 0.0;
        }
        let tau = self.width as f64;
        let t = (timestep - self.delay) as f64 - 4.0 * tau;
        self.amplitude * (-(t / tau).powi(2)).exp()
    }
}

pub struct SlabEngine {
    ez: Vec<f64>,
    hy: Vec<f64>,
    ca: f64,
    cb: f64,
    sources: Vec<Source>,
    timestep: u64,
}

impl SlabEngine {
    /// Build from a validated grid configuration
    pub fn new(grid: &GridConfig) -> Self {
        let loss = grid.conductivity;
        Self {
            ez: vec![0.0; grid.cells],
            hy: vec![0.0; grid.cells - 1],
            ca: (1.0 - loss) / (1.0 + loss),
            cb: grid.courant / (1.0 + loss),
            sources: grid.sources.iter().map(Source::from_config).collect(),
            timestep: 0,
        }
    }

    fn step(&mut self) {
        let (ca, cb) = (self.ca, self.cb);

        for i in 0..self.hy.len() {
            self.hy[i] = ca * self.hy[i] + cb * (self.ez[i + 1] - self.ez[i]);
        }

        // ends stay at zero (PEC)
        let last = self.ez.len() - 1;
        for i in 1..last {
            self.ez[i] = ca * self.ez[i] + cb * (self.hy[i] - self.hy[i - 1]);
        }

        for source in &self.sources {
            self.ez[source.position] += source.value(self.timestep);
        }

        self.timestep += 1;
    }
}

impl FieldSource for SlabEngine {
    fn local_field_energy(&self) -> f64 {
        let e: f64 = self.ez.iter().map(|v| v * v).sum();
        let h: f64 = self.hy.iter().map(|v| v * v).sum();
        0.5 * (e + h)
    }
}

impl Engine for SlabEngine {
    fn advance_by(&mut self, steps: u64) {
        for _ in 0..steps {
            self.step();
        }
        trace!(steps, timestep = self.timestep, "SlabEngine::advance_by");
    }

    fn current_timestep(&self) -> u64 {
        self.timestep
    }

    fn local_cell_count(&self) -> u64 {
        self.ez.len() as u64
    }

    fn excitation_checkpoints(&self) -> Vec<u64> {
        let max_excite = self.sources.iter().map(|s| PULSE_SPAN * s.width).max().unwrap_or(0);
        let mut checkpoints: Vec<u64> = self.sources.iter().map(|s| s.delay + max_excite).collect();
        checkpoints.sort_unstable();
        checkpoints.dedup();
        checkpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(conductivity: f64) -> GridConfig {
        GridConfig {
            cells: 400,
            courant: 0.5,
            conductivity,
            sources: vec![SourceConfig {
                position: 200,
                delay: 0,
                width: 10,
                amplitude: 1.0,
            }],
        }
    }

    #[test]
    fn test_starts_empty() {
        let engine = SlabEngine::new(&grid(0.0));
        assert_eq!(engine.current_timestep(), 0);
        assert_eq!(engine.local_cell_count(), 400);
        assert_eq!(engine.local_field_energy(), 0.0);
    }

    #[test]
    fn test_pulse_injects_energy() {
        let mut engine = SlabEngine::new(&grid(0.0));
        engine.advance_by(80);
        assert_eq!(engine.current_timestep(), 80);
        assert!(engine.local_field_energy() > 0.0);
    }

    #[test]
    fn test_lossless_energy_stays_bounded() {
        let mut engine = SlabEngine::new(&grid(0.0));
        engine.advance_by(81);
        let after_pulse = engine.local_field_energy();
        engine.advance_by(100);
        let later = engine.local_field_energy();
        assert!(later > 0.5 * after_pulse);
        assert!(later < 2.0 * after_pulse);
    }

    #[test]
    fn test_loss_decays_energy() {
        let mut engine = SlabEngine::new(&grid(0.01));
        engine.advance_by(81);
        let after_pulse = engine.local_field_energy();
        engine.advance_by(500);
        assert!(engine.local_field_energy() < 1e-3 * after_pulse);
    }

    #[test]
    fn test_excitation_checkpoints() {
        let mut config = grid(0.0);
        config.sources.push(SourceConfig {
            position: 100,
            delay: 50,
            width: 5,
            amplitude: 1.0,
        });
        let engine = SlabEngine::new(&config);
        assert_eq!(engine.excitation_checkpoints(), vec![80, 130]);
    }

    #[test]
    fn test_no_sources_no_checkpoints() {
        let mut config = grid(0.0);
        config.sources.clear();
        let mut engine = SlabEngine::new(&config);
        assert!(engine.excitation_checkpoints().is_empty());
        engine.advance_by(10);
        assert_eq!(engine.local_field_energy(), 0.0);
    }
}
