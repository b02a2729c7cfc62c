//! Frames exchanged between ranks
//!
//! Simple JSON-over-newline protocol for the TCP transport. Each frame is a
//! single line of JSON followed by `\n`. The in-process group sends the same
//! frames over channels.

use serde::{Deserialize, Serialize};

use super::{ReduceOp, Scalar};

/// A single message between a peer and the leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// First frame a peer sends after connecting
    Hello { rank: usize, size: usize },

    /// Peer's contribution to a reduction
    Contribute {
        rank: usize,
        seq: u64,
        op: ReduceOp,
        value: Scalar,
    },

    /// Leader's broadcast value
    Result { seq: u64, value: Scalar },
}

impl Frame {
    pub fn seq(&self) -> Option<u64> {
        match self {
            Frame::Hello { .. } => None,
            Frame::Contribute { seq, .. } | Frame::Result { seq, .. } => Some(*seq),
        }
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
