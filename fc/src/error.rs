//! Coordinator error types

use thiserror::Error;

/// Errors that can occur while coordinating a distributed run
#[derive(Debug, Error)]
pub enum CoordError {
    /// Unrecognized or malformed CLI/config input. Never fatal by itself.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A rank failed to reach or complete a reduction/broadcast
    #[error("Collective {op} failed on rank {rank}: {reason}")]
    CollectiveFailure { op: String, rank: usize, reason: String },

    /// Leader-only setup failed (listener bind, peer slot table)
    #[error("Resource allocation failed on leader: {0}")]
    ResourceAllocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordError {
    /// Build a collective failure for the given operation and rank
    pub fn collective(op: impl Into<String>, rank: usize, reason: impl Into<String>) -> Self {
        CoordError::CollectiveFailure {
            op: op.into(),
            rank,
            reason: reason.into(),
        }
    }

    /// Check if this is a collective failure
    pub fn is_collective_failure(&self) -> bool {
        matches!(self, CoordError::CollectiveFailure { .. })
    }

    /// Check if this error must abort the whole run
    ///
    /// Configuration errors are handled by the caller (usage/help); anything
    /// else may leave replicated state diverged across ranks.
    pub fn is_fatal(&self) -> bool {
        match self {
            CoordError::Configuration(_) => false,
            CoordError::CollectiveFailure { .. } => true,
            CoordError::ResourceAllocation(_) => true,
            CoordError::Io(_) => true,
            CoordError::Json(_) => true,
        }
    }
}
