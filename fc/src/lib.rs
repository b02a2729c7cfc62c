//! fdtdcoord - Distributed time-stepping coordinator for FDTD simulations
//!
//! Every rank owns one subdomain of a field simulation. The coordinator
//! keeps the ranks' view of "how far to advance next", "has the energy
//! decayed enough" and "should we stop" identical everywhere, using only
//! blocking reduce-then-broadcast collectives.
//!
//! # Core Concepts
//!
//! - **Burst negotiation**: the group advances by the smallest proposal
//! - **Energy convergence**: the summed field energy is tracked against its
//!   peak; the leader decides when the decay crosses the end criteria
//! - **Single termination channel**: stopping is always a zero burst
//!   proposal folded through the minimum reduction
//!
//! # Modules
//!
//! - [`transport`] - Group transports (single process, in-process, TCP)
//! - [`collective`] - Typed reduce/broadcast primitives
//! - [`negotiator`] - Burst negotiation and the replicated clock
//! - [`energy`] - Energy convergence monitor
//! - [`reporter`] - Leader progress reporting
//! - [`lifecycle`] - The run state machine
//! - [`engine`] - Engine and pipeline contracts
//! - [`slab`] / [`processing`] - Built-in engine and pipeline
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod collective;
pub mod config;
pub mod energy;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod negotiator;
pub mod processing;
pub mod reporter;
pub mod slab;
pub mod transport;

// Re-export commonly used types
pub use collective::Collectives;
pub use config::Config;
pub use energy::{EnergyMonitor, EnergyState};
pub use engine::{Engine, FieldPipeline, FieldSource};
pub use error::CoordError;
pub use lifecycle::{AbortSignal, Coordinator, Phase, RunSummary, StopReason};
pub use negotiator::{SimulationClock, StepNegotiator};
pub use processing::{EnergyProbe, ProcessingArray};
pub use reporter::{FinalStats, ProgressReporter};
pub use slab::SlabEngine;
pub use transport::{LocalGroup, RankIdentity, SoloTransport, TcpTransport, Transport};
