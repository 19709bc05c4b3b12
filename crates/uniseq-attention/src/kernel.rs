//! Attention kernel trait
//!
//! The kernel is the per-device attention primitive the ring step calls
//! once per chunk. It receives the head-sharded, full-sequence query and
//! key/value of one rank and is responsible for circulating key/value
//! blocks around the ring group.

use crate::params::Descale;
use crate::processor::AttentionProcessor;
use candle_core::Tensor;
use std::fmt;
use uniseq_comm::ProcessGroup;
use uniseq_types::{AttnType, JointStrategy, Result, RingImplType};

/// Arguments of one kernel invocation
pub struct KernelArgs<'a> {
    /// `(batch, seq, heads, head_dim)`
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub dropout_p: f64,
    pub softmax_scale: Option<f64>,
    pub causal: bool,
    pub window_size: (i64, i64),
    /// Slopes of the local heads only
    pub alibi_slopes: Option<&'a Tensor>,
    pub deterministic: bool,
    pub return_attn_probs: bool,
    /// Ring group key/value blocks circulate on
    pub group: &'a dyn ProcessGroup,
    pub attn_type: AttnType,
    pub ring_impl: RingImplType,
    pub processor: Option<&'a dyn AttentionProcessor>,
    /// Joint key/value for the local heads
    pub joint_key: Option<&'a Tensor>,
    pub joint_value: Option<&'a Tensor>,
    pub joint_strategy: JointStrategy,
    pub descale: &'a Descale,
}

impl fmt::Debug for KernelArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelArgs")
            .field("query", &self.query.shape())
            .field("key", &self.key.shape())
            .field("causal", &self.causal)
            .field("window_size", &self.window_size)
            .field("ring_rank", &self.group.rank())
            .field("ring_size", &self.group.world_size())
            .field("attn_type", &self.attn_type)
            .field("ring_impl", &self.ring_impl)
            .field("joint_strategy", &self.joint_strategy)
            .finish()
    }
}

/// Kernel result
#[derive(Debug, Clone)]
pub struct KernelOutput {
    /// Attention context, same layout as the query
    pub context: Tensor,
    /// Log-sum-exp per `(batch, heads, seq)` when attention probabilities were requested
    pub softmax_lse: Option<Tensor>,
}

impl KernelOutput {
    /// Output without auxiliary tensors
    pub fn context_only(context: Tensor) -> Self {
        Self {
            context,
            softmax_lse: None,
        }
    }
}

/// Per-device ring attention primitive
pub trait AttentionKernel: Send + Sync {
    /// Kernel name for logging
    fn name(&self) -> &str;

    /// Attend `query` over every key/value block of the ring group
    fn forward(&self, args: KernelArgs<'_>) -> Result<KernelOutput>;
}
