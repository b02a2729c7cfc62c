//! Coordinator configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CoordError;
use crate::transport::TcpOptions;

/// Sentinel file checked when no `abort-file` is configured
pub const DEFAULT_ABORT_FILE: &str = "ABORT";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Timestep budget and end criteria
    pub simulation: SimulationConfig,

    /// Progress and flush cadence
    pub reporting: ReportingConfig,

    /// Multi-process group settings
    pub transport: TransportConfig,

    /// Built-in slab engine parameters
    pub grid: GridConfig,

    /// Sentinel file; its existence requests an abort on that rank
    #[serde(rename = "abort-file")]
    pub abort_file: Option<PathBuf>,

    /// Directory for per-rank energy traces (JSON lines)
    #[serde(rename = "energy-trace-dir")]
    pub energy_trace_dir: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Returns a configuration error describing the first bad value.
    pub fn validate(&self) -> Result<(), CoordError> {
        let sim = &self.simulation;
        if sim.num_timesteps == 0 {
            return Err(CoordError::Configuration("num-timesteps must be positive".to_string()));
        }
        if !(sim.end_criteria_db.is_finite() && sim.end_criteria_db >= 0.0) {
            return Err(CoordError::Configuration(format!(
                "end-criteria-db must be a non-negative number of dB, got {}",
                sim.end_criteria_db
            )));
        }
        if sim.max_burst == 0 {
            return Err(CoordError::Configuration("max-burst must be positive".to_string()));
        }
        self.grid.validate()?;
        Ok(())
    }

    /// Abort sentinel path, `ABORT` in the working directory by default
    pub fn abort_path(&self) -> PathBuf {
        self.abort_file.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_ABORT_FILE))
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./fdtdcoord.yml
        let local_config = PathBuf::from("fdtdcoord.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/fdtdcoord/fdtdcoord.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("fdtdcoord").join("fdtdcoord.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = config_path?;
        let content = fs::read_to_string(path).ok()?;
        let config: Self = serde_yaml::from_str(&content).ok()?;
        config.log_level
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Timestep budget and convergence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Total timestep budget
    #[serde(rename = "num-timesteps")]
    pub num_timesteps: u64,

    /// Energy decay (dB) that counts as converged; 0 runs to the full budget
    #[serde(rename = "end-criteria-db")]
    pub end_criteria_db: f64,

    /// Upper bound on a single burst
    #[serde(rename = "max-burst")]
    pub max_burst: u64,

    /// Periodic energy sample cadence in timesteps (0 disables)
    #[serde(rename = "energy-sample-interval")]
    pub energy_sample_interval: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_timesteps: 20_000,
            end_criteria_db: 60.0,
            max_burst: 1000,
            energy_sample_interval: 500,
        }
    }
}

/// Reporting cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Progress report interval in milliseconds
    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,

    /// Pipeline flush interval in milliseconds
    #[serde(rename = "flush-interval-ms")]
    pub flush_interval_ms: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 4000,
            flush_interval_ms: 4000,
        }
    }
}

impl ReportingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Multi-process group settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the leader listens on and peers connect to
    #[serde(rename = "leader-addr")]
    pub leader_addr: String,

    /// Group formation timeout in milliseconds
    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,

    /// Collective timeout in milliseconds; absent blocks forever
    #[serde(rename = "collective-timeout-ms")]
    pub collective_timeout_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            leader_addr: "127.0.0.1:7450".to_string(),
            connect_timeout_ms: 30_000,
            collective_timeout_ms: None,
        }
    }
}

impl TransportConfig {
    pub fn tcp_options(&self) -> TcpOptions {
        TcpOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            collective_timeout: self.collective_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Built-in 1-D slab engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Cells in each rank's slab
    pub cells: usize,

    /// Courant number c*dt/dx (must be in (0, 1])
    pub courant: f64,

    /// Normalized loss per half step
    pub conductivity: f64,

    /// Gaussian pulse sources
    pub sources: Vec<SourceConfig>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cells: 2000,
            courant: 0.5,
            conductivity: 0.002,
            sources: vec![SourceConfig::default()],
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.cells < 3 {
            return Err(CoordError::Configuration(format!(
                "grid needs at least 3 cells, got {}",
                self.cells
            )));
        }
        if !(self.courant > 0.0 && self.courant <= 1.0) {
            return Err(CoordError::Configuration(format!(
                "courant number must be in (0, 1], got {}",
                self.courant
            )));
        }
        if !(self.conductivity >= 0.0 && self.conductivity.is_finite()) {
            return Err(CoordError::Configuration(format!(
                "conductivity must be non-negative, got {}",
                self.conductivity
            )));
        }
        for source in &self.sources {
            if source.position == 0 || source.position >= self.cells - 1 {
                return Err(CoordError::Configuration(format!(
                    "source position {} outside grid interior (1..{})",
                    source.position,
                    self.cells - 1
                )));
            }
            if source.width == 0 {
                return Err(CoordError::Configuration("source width must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// Gaussian pulse source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Cell index of the soft source
    pub position: usize,

    /// Timestep at which the pulse starts
    pub delay: u64,

    /// Pulse width in timesteps
    pub width: u64,

    pub amplitude: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            position: 500,
            delay: 0,
            width: 20,
            amplitude: 1.0,
        }
    }
}
