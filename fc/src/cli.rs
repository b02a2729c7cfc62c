//! CLI command definitions and subcommands

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::debug;

use crate::config::Config;
use crate::error::CoordError;
use crate::transport::RankIdentity;

/// fdtdcoord - distributed FDTD time-stepping coordinator
#[derive(Parser)]
#[command(
    name = "fc",
    about = "Drive FDTD subdomain ranks to a synchronized, energy-converged finish",
    version
)]
pub struct Cli {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Print the energy probe schedule during preprocessing
    #[arg(long = "show-probe-discretization", global = true)]
    pub show_probe_discretization: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one rank of a simulation
    Run(RunArgs),

    /// Spawn N local ranks of `fc run --engine=MPI` and wait for them
    Launch {
        /// Simulation config file
        config: PathBuf,

        /// Number of ranks
        #[arg(short = 'n', long = "ranks", default_value = "2")]
        ranks: usize,
    },

    /// Print the effective configuration as YAML
    ShowConfig {
        /// Config file (falls back to ./fdtdcoord.yml, then the user config)
        config: Option<PathBuf>,
    },
}

/// Coordinator selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EngineType {
    /// Single process
    #[default]
    Basic,
    /// One process per rank, coordinated over TCP collectives
    Mpi,
}

/// Arguments for `fc run`
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Simulation config file
    pub config: PathBuf,

    /// Coordinator to use
    #[arg(long, value_enum, ignore_case = true, default_value_t = EngineType::Basic)]
    pub engine: EngineType,

    /// This process's rank (mpi engine)
    #[arg(long)]
    pub rank: Option<usize>,

    /// Total number of ranks (mpi engine)
    #[arg(long)]
    pub size: Option<usize>,

    /// Leader address, overriding transport.leader-addr
    #[arg(long)]
    pub leader: Option<String>,

    /// Override simulation.num-timesteps
    #[arg(long = "num-timesteps")]
    pub num_timesteps: Option<u64>,

    /// Override simulation.end-criteria-db
    #[arg(long = "end-criteria-db")]
    pub end_criteria_db: Option<f64>,
}

impl RunArgs {
    /// Fold command-line overrides into a loaded config
    pub fn apply(&self, config: &mut Config) {
        if let Some(n) = self.num_timesteps {
            config.simulation.num_timesteps = n;
        }
        if let Some(db) = self.end_criteria_db {
            config.simulation.end_criteria_db = db;
        }
        if let Some(leader) = &self.leader {
            config.transport.leader_addr = leader.clone();
        }
    }

    /// Rank identity implied by the engine selection
    pub fn identity(&self) -> Result<RankIdentity, CoordError> {
        match self.engine {
            EngineType::Basic => {
                if self.rank.unwrap_or(0) != 0 || self.size.unwrap_or(1) != 1 {
                    return Err(CoordError::Configuration(
                        "--rank/--size require --engine=MPI".to_string(),
                    ));
                }
                Ok(RankIdentity::solo())
            }
            EngineType::Mpi => {
                let (Some(rank), Some(size)) = (self.rank, self.size) else {
                    return Err(CoordError::Configuration(
                        "--engine=MPI needs both --rank and --size".to_string(),
                    ));
                };
                RankIdentity::new(rank, size)
            }
        }
    }

    /// Rank used to name the log file
    pub fn log_rank(&self) -> usize {
        self.rank.unwrap_or(0)
    }
}

/// Get the log file path for a rank; `None` names the launcher's log
pub fn get_log_path(rank: Option<usize>) -> PathBuf {
    let name = match rank {
        Some(rank) => format!("fc-rank{}.log", rank),
        None => "fc.log".to_string(),
    };
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fdtdcoord")
        .join("logs")
        .join(name);
    debug!(?path, "get_log_path: returning path");
    path
}

/// Generate the after_help text
pub fn generate_after_help() -> String {
    let log_dir = get_log_path(None)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let mut help = String::new();
    help.push_str("Engines:\n");
    help.push_str("  basic   single process (default)\n");
    help.push_str("  mpi     one process per rank; rank 0 leads\n");
    help.push('\n');
    help.push_str("Create a file named ABORT in the working directory to stop a run early.\n");
    help.push_str(&format!("Logs are written to: {}\n", log_dir));
    help
}
