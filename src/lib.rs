//! # uniseq
//!
//! Sequence-parallel self-attention for sequences too long for one device.
//! The sequence is sharded over `ulysses_degree x ring_degree` ranks:
//!
//! - inside a ulysses group, an all-to-all swaps sequence sharding for head
//!   sharding, so every rank sees the whole (ring-local) sequence for a
//!   subset of heads;
//! - inside a ring group, key/value blocks are passed around so every query
//!   attends to the full sequence.
//!
//! The pipelined forward splits the heads into chunks and overlaps the
//! exchange of one chunk with attention on another, over three lanes.
//!
//! ```no_run
//! use uniseq::prelude::*;
//!
//! # fn main() -> uniseq::Result<()> {
//! let lanes = LaneSet::new()?;
//! let layer = LongContextAttention::builder(HybridGroups::single()).build()?;
//! let q = candle_core::Tensor::zeros((1, 16, 8, 64), candle_core::DType::F32, &candle_core::Device::Cpu)?;
//! let out = layer.forward(&lanes, &AttentionModule::new("attn"), &q, &q, &q, &AttentionParams::default())?;
//! assert_eq!(out.dims(), q.dims());
//! # Ok(())
//! # }
//! ```

pub mod test_utils;
pub mod utils;

pub use uniseq_attention as attention;
pub use uniseq_comm as comm;
pub use uniseq_runtime as runtime;
pub use uniseq_types as types;

pub use uniseq_types::{Result, UniseqError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types
pub mod prelude {
    pub use uniseq_attention::{
        AttentionKernel, AttentionModule, AttentionParams, AttentionProcessor, Descale,
        KvCache, LinearLongContextAttention, LongContextAttention, PatchKvCache,
        ReferenceAttention, ReluLinearAttention,
    };
    pub use uniseq_comm::{HybridGroups, HybridTopology, LocalProcessGroup, ProcessGroup};
    pub use uniseq_runtime::{LaneOptions, LaneSet};
    pub use uniseq_types::{
        AttnType, ForwardMode, HybridParallelConfig, LongContextAttentionConfig, Result,
        RingImplType, UniseqError,
    };
}
