//! Parallel topology and lane identity types

use crate::{Result, UniseqError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution lane identity
///
/// Every lane also owns its own communicator channel, so collectives issued
/// on different lanes never interleave on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LaneKind {
    /// Sequence-to-head exchanges feeding the compute lane
    InputComm,
    /// Ring attention computation
    Compute,
    /// Head-to-sequence exchanges draining the compute lane
    OutputComm,
}

impl LaneKind {
    /// All lanes in issue order
    pub const ALL: [LaneKind; 3] = [LaneKind::InputComm, LaneKind::Compute, LaneKind::OutputComm];

    /// Short lane name used for thread names and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            LaneKind::InputComm => "input-comm",
            LaneKind::Compute => "compute",
            LaneKind::OutputComm => "output-comm",
        }
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hybrid sequence-parallel layout: ulysses (head sharding) x ring (sequence sharding)
///
/// Ulysses is the inner dimension: global rank `g` sits at ulysses rank
/// `g % ulysses_degree` and ring rank `g / ulysses_degree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridParallelConfig {
    /// Size of each head-sharding (all-to-all) group
    pub ulysses_degree: usize,
    /// Size of each ring-sharding group
    pub ring_degree: usize,
}

impl Default for HybridParallelConfig {
    fn default() -> Self {
        Self {
            ulysses_degree: 1,
            ring_degree: 1,
        }
    }
}

impl HybridParallelConfig {
    /// Create a validated layout
    pub fn new(ulysses_degree: usize, ring_degree: usize) -> Result<Self> {
        if ulysses_degree == 0 || ring_degree == 0 {
            return Err(UniseqError::config(format!(
                "ulysses_degree ({}) and ring_degree ({}) must be >= 1",
                ulysses_degree, ring_degree
            )));
        }
        Ok(Self {
            ulysses_degree,
            ring_degree,
        })
    }

    /// Total number of ranks
    pub fn world_size(&self) -> usize {
        self.ulysses_degree * self.ring_degree
    }

    /// Check if any sharding is enabled
    pub fn is_parallel(&self) -> bool {
        self.world_size() > 1
    }

    /// Rank inside the head-sharding group
    pub fn ulysses_rank(&self, global_rank: usize) -> usize {
        global_rank % self.ulysses_degree
    }

    /// Rank inside the ring-sharding group
    pub fn ring_rank(&self, global_rank: usize) -> usize {
        global_rank / self.ulysses_degree
    }

    /// Global ranks that share a head-sharding group with `global_rank`
    pub fn ulysses_members(&self, global_rank: usize) -> Vec<usize> {
        let base = self.ring_rank(global_rank) * self.ulysses_degree;
        (base..base + self.ulysses_degree).collect()
    }

    /// Global ranks that share a ring group with `global_rank`
    pub fn ring_members(&self, global_rank: usize) -> Vec<usize> {
        let offset = self.ulysses_rank(global_rank);
        (0..self.ring_degree)
            .map(|r| r * self.ulysses_degree + offset)
            .collect()
    }
}
