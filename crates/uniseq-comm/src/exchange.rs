//! Head-sharding exchange (Ulysses all-to-all)
//!
//! Layout convention for 4-D shards: `(batch, seq, heads, head_dim)`.
//!
//! - scatter 2 / gather 1: `(b, s/N, h, d)` -> `(b, s, h/N, d)`
//! - scatter 1 / gather 2: `(b, s, h/N, d)` -> `(b, s/N, h, d)`
//!
//! The exchange only moves data, so forward followed by inverse is bit-exact.

use crate::group::ProcessGroup;
use candle_core::Tensor;
use std::sync::Arc;
use tracing::trace;
use uniseq_types::{LaneKind, Result, UniseqError};

/// All-to-all re-layout of a 4-D tensor within `group`
///
/// Splits `input` into `world_size` equal parts along `scatter_idx`, sends
/// part `j` to rank `j`, and concatenates the received parts along
/// `gather_idx` in source-rank order.
pub fn seq_all_to_all_4d(
    group: &dyn ProcessGroup,
    input: &Tensor,
    scatter_idx: usize,
    gather_idx: usize,
    channel: LaneKind,
) -> Result<Tensor> {
    let dims = input.dims();
    if dims.len() != 4 {
        return Err(UniseqError::input_validation(format!(
            "all-to-all expects a 4-D tensor, got shape {:?}",
            dims
        )));
    }
    if scatter_idx > 3 || gather_idx > 3 || scatter_idx == gather_idx {
        return Err(UniseqError::input_validation(format!(
            "invalid scatter/gather pair ({}, {})",
            scatter_idx, gather_idx
        )));
    }

    let world = group.world_size();
    if world == 1 {
        return Ok(input.clone());
    }

    let scatter_len = dims[scatter_idx];
    if scatter_len % world != 0 {
        return Err(UniseqError::input_validation(format!(
            "dim {} of size {} is not divisible by group size {}",
            scatter_idx, scatter_len, world
        )));
    }
    let part = scatter_len / world;

    let parts = (0..world)
        .map(|j| -> Result<Tensor> { Ok(input.narrow(scatter_idx, j * part, part)?.contiguous()?) })
        .collect::<Result<Vec<_>>>()?;
    let received = group.all_to_all(parts, channel)?;
    let output = Tensor::cat(&received, gather_idx)?;

    trace!(
        "all_to_all rank {} {:?} -> {:?} (scatter {}, gather {})",
        group.rank(),
        dims,
        output.dims(),
        scatter_idx,
        gather_idx
    );
    Ok(output)
}

/// A contiguous range of attention heads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadRange {
    /// First head
    pub start: usize,
    /// Number of heads
    pub len: usize,
}

impl HeadRange {
    /// Create a head range
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// One past the last head
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Heads held by `rank` after exchanging all `total_heads` at once
    pub fn for_rank(total_heads: usize, world_size: usize, rank: usize) -> Result<Self> {
        if world_size == 0 || total_heads % world_size != 0 {
            return Err(UniseqError::input_validation(format!(
                "{} heads cannot be split across {} ranks",
                total_heads, world_size
            )));
        }
        let len = total_heads / world_size;
        Ok(Self::new(rank * len, len))
    }

    /// Heads held by `rank` after exchanging chunk `chunk` of `chunk_heads` heads
    pub fn for_chunk(chunk: usize, chunk_heads: usize, world_size: usize, rank: usize) -> Result<Self> {
        let local = Self::for_rank(chunk_heads, world_size, rank)?;
        Ok(Self::new(chunk * chunk_heads + local.start, local.len))
    }

    /// Slice `tensor` to this range along `dim`
    pub fn slice(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        let size = tensor.dim(dim)?;
        if self.end() > size {
            return Err(UniseqError::input_validation(format!(
                "head range {}..{} exceeds dim {} of size {}",
                self.start,
                self.end(),
                dim,
                size
            )));
        }
        Ok(tensor.narrow(dim, self.start, self.len)?)
    }
}

/// Ulysses exchange bound to a head-sharding group
#[derive(Clone)]
pub struct HeadExchange {
    group: Arc<dyn ProcessGroup>,
    scatter_idx: usize,
    gather_idx: usize,
}

impl HeadExchange {
    /// Create an exchange over `group`
    pub fn new(group: Arc<dyn ProcessGroup>, scatter_idx: usize, gather_idx: usize) -> Self {
        Self {
            group,
            scatter_idx,
            gather_idx,
        }
    }

    /// The head-sharding group
    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    /// Sequence-sharded to head-sharded
    pub fn forward(&self, input: &Tensor, channel: LaneKind) -> Result<Tensor> {
        seq_all_to_all_4d(
            self.group.as_ref(),
            input,
            self.scatter_idx,
            self.gather_idx,
            channel,
        )
    }

    /// Head-sharded back to sequence-sharded
    pub fn inverse(&self, input: &Tensor, channel: LaneKind) -> Result<Tensor> {
        seq_all_to_all_4d(
            self.group.as_ref(),
            input,
            self.gather_idx,
            self.scatter_idx,
            channel,
        )
    }
}
