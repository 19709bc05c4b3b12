//! Attention kernel, ring layout and joint-tensor enumerations

use crate::{Result, UniseqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Attention kernel variant requested from the per-device kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttnType {
    /// Plain scaled dot-product attention
    Torch,
    /// Flash Attention 2
    Fa,
    /// Flash Attention 3
    Fa3,
    /// Sage attention with fp16 accumulation
    SageFp16,
    /// Sage attention with fp8 accumulation
    SageFp8,
}

impl Default for AttnType {
    fn default() -> Self {
        Self::Fa
    }
}

impl AttnType {
    /// Whether the kernel consumes quantized inputs and needs descale factors
    pub fn is_quantized(&self) -> bool {
        matches!(self, AttnType::Fa3 | AttnType::SageFp8)
    }
}

impl fmt::Display for AttnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttnType::Torch => write!(f, "torch"),
            AttnType::Fa => write!(f, "fa"),
            AttnType::Fa3 => write!(f, "fa3"),
            AttnType::SageFp16 => write!(f, "sage_fp16"),
            AttnType::SageFp8 => write!(f, "sage_fp8"),
        }
    }
}

impl FromStr for AttnType {
    type Err = UniseqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "torch" => Ok(AttnType::Torch),
            "fa" => Ok(AttnType::Fa),
            "fa3" => Ok(AttnType::Fa3),
            "sage_fp16" => Ok(AttnType::SageFp16),
            "sage_fp8" => Ok(AttnType::SageFp8),
            other => Err(UniseqError::config(format!(
                "unknown attention type: {}",
                other
            ))),
        }
    }
}

/// Ring attention layout strategy
///
/// Each variant fixes which global sequence positions a ring rank owns. The
/// layout only matters for position-dependent masking (causal, window,
/// alibi); the kernel contract is identical for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingImplType {
    /// Contiguous blocks: rank r owns block r
    Basic,
    /// Two half-blocks per rank, r and 2R-1-r, balancing causal work
    Zigzag,
    /// Round-robin striping: local token i sits at global position i*R + r
    Strip,
}

impl Default for RingImplType {
    fn default() -> Self {
        Self::Basic
    }
}

impl RingImplType {
    /// Variants that may thread a persistent per-rank KV cache
    pub const KV_CACHE_SUPPORTED: &'static [RingImplType] = &[RingImplType::Basic];

    /// Whether this variant supports the persistent KV cache
    pub fn supports_kv_cache(&self) -> bool {
        Self::KV_CACHE_SUPPORTED.contains(self)
    }

    /// Global sequence positions of the `local_len` tokens held by `ring_rank`
    pub fn positions(&self, ring_rank: usize, ring_size: usize, local_len: usize) -> Result<Vec<usize>> {
        if ring_rank >= ring_size {
            return Err(UniseqError::input_validation(format!(
                "ring rank {} >= ring size {}",
                ring_rank, ring_size
            )));
        }
        match self {
            RingImplType::Basic => {
                let start = ring_rank * local_len;
                Ok((start..start + local_len).collect())
            }
            RingImplType::Zigzag => {
                if local_len % 2 != 0 {
                    return Err(UniseqError::input_validation(format!(
                        "zigzag ring layout needs an even local length, got {}",
                        local_len
                    )));
                }
                let half = local_len / 2;
                let head = ring_rank * half;
                let tail = (2 * ring_size - 1 - ring_rank) * half;
                Ok((head..head + half).chain(tail..tail + half).collect())
            }
            RingImplType::Strip => Ok((0..local_len)
                .map(|i| i * ring_size + ring_rank)
                .collect()),
        }
    }
}

impl fmt::Display for RingImplType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingImplType::Basic => write!(f, "basic"),
            RingImplType::Zigzag => write!(f, "zigzag"),
            RingImplType::Strip => write!(f, "strip"),
        }
    }
}

impl FromStr for RingImplType {
    type Err = UniseqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "basic" => Ok(RingImplType::Basic),
            "zigzag" => Ok(RingImplType::Zigzag),
            "strip" => Ok(RingImplType::Strip),
            other => Err(UniseqError::config(format!(
                "unknown ring_impl_type: {}, supported: basic, zigzag, strip",
                other
            ))),
        }
    }
}

/// Placement of replicated joint tensors relative to the local shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointStrategy {
    /// No joint tensors
    None,
    /// Joint segment placed before the local sequence
    Front,
    /// Joint segment placed after the local sequence
    Rear,
}

impl Default for JointStrategy {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for JointStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JointStrategy::None => write!(f, "none"),
            JointStrategy::Front => write!(f, "front"),
            JointStrategy::Rear => write!(f, "rear"),
        }
    }
}

impl FromStr for JointStrategy {
    type Err = UniseqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(JointStrategy::None),
            "front" => Ok(JointStrategy::Front),
            "rear" => Ok(JointStrategy::Rear),
            other => Err(UniseqError::input_validation(format!(
                "joint_strategy: {} not supported, supported joint strategy: [front, rear]",
                other
            ))),
        }
    }
}
