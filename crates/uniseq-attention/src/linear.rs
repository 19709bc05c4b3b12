//! Linear-attention variant
//!
//! Same exchange as [`crate::LongContextAttention`], but the ring kernel is
//! a linear attention that only needs the ring group and the optional
//! cache. Its output comes back heads-first, so it is transposed before
//! the inverse exchange and the head axis is folded into the hidden size.

use crate::kv_cache::{AttentionModule, KvCache};
use crate::layer::{check_qkv, split_packed};
use candle_core::{DType, Tensor};
use std::sync::Arc;
use tracing::{debug, info};
use uniseq_comm::{HeadExchange, HybridGroups, ProcessGroup};
use uniseq_types::{LaneKind, LongContextAttentionConfig, Result, UniseqError};

/// Linear attention primitive over a ring group
pub trait LinearRingKernel: Send + Sync {
    /// Kernel name for logging
    fn name(&self) -> &str;

    /// Attend `(batch, seq, heads, head_dim)` inputs over every ring block
    ///
    /// Returns `(batch, heads, seq, head_dim)`.
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        group: &dyn ProcessGroup,
        cache: Option<&mut dyn KvCache>,
    ) -> Result<Tensor>;
}

/// ReLU feature-map linear attention
///
/// `out_i = phi(q_i) S / (phi(q_i) z + eps)` with `S = sum_j phi(k_j)^T v_j`
/// and `z = sum_j phi(k_j)`; the ring only has to circulate `S` and `z`.
#[derive(Debug, Clone)]
pub struct ReluLinearAttention {
    eps: f64,
}

impl Default for ReluLinearAttention {
    fn default() -> Self {
        Self { eps: 1e-6 }
    }
}

impl ReluLinearAttention {
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }
}

impl LinearRingKernel for ReluLinearAttention {
    fn name(&self) -> &str {
        "relu_linear"
    }

    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        group: &dyn ProcessGroup,
        cache: Option<&mut dyn KvCache>,
    ) -> Result<Tensor> {
        let (key, value) = match cache {
            Some(cache) => cache.update_and_get(0, key, value)?,
            None => (key.clone(), value.clone()),
        };
        let out_dtype = query.dtype();
        let heads_first =
            |t: &Tensor| -> Result<Tensor> { Ok(t.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?) };
        let phi_q = heads_first(query)?.relu()?;
        let phi_k = heads_first(&key)?.relu()?;
        let value = heads_first(&value)?;

        // (b, h, d, d) state and (b, h, 1, d) normaliser of the local block
        let mut state = phi_k.transpose(2, 3)?.contiguous()?.matmul(&value)?;
        let mut norm = phi_k.sum_keepdim(2)?;

        let (rank, size) = (group.rank(), group.world_size());
        if size > 1 {
            let next = (rank + 1) % size;
            let prev = (rank + size - 1) % size;
            let (mut block_state, mut block_norm) = (state.clone(), norm.clone());
            for _ in 1..size {
                group.send(&block_state, next, LaneKind::Compute)?;
                group.send(&block_norm, next, LaneKind::Compute)?;
                block_state = group.recv(prev, LaneKind::Compute)?;
                block_norm = group.recv(prev, LaneKind::Compute)?;
                state = (state + &block_state)?;
                norm = (norm + &block_norm)?;
            }
        }

        let numerator = phi_q.matmul(&state)?;
        let denominator = (phi_q.matmul(&norm.transpose(2, 3)?.contiguous()?)? + self.eps)?;
        Ok(numerator.broadcast_div(&denominator)?.to_dtype(out_dtype)?)
    }
}

/// Long-context linear attention, sequential path only
pub struct LinearLongContextAttention {
    config: LongContextAttentionConfig,
    groups: HybridGroups,
    exchange: HeadExchange,
    kernel: Arc<dyn LinearRingKernel>,
}

impl LinearLongContextAttention {
    pub fn new(
        groups: HybridGroups,
        config: LongContextAttentionConfig,
        kernel: Arc<dyn LinearRingKernel>,
    ) -> Result<Self> {
        config.validate()?;
        let exchange = HeadExchange::new(
            Arc::clone(&groups.ulysses),
            config.scatter_idx,
            config.gather_idx,
        );
        info!(
            "Linear long-context attention on rank {}: ulysses {} x ring {} (kernel {})",
            groups.global_rank,
            groups.ulysses_size(),
            groups.ring_size(),
            kernel.name()
        );
        Ok(Self {
            config,
            groups,
            exchange,
            kernel,
        })
    }

    pub fn config(&self) -> &LongContextAttentionConfig {
        &self.config
    }

    /// `(batch, seq/N, heads, head_dim)` inputs to `(batch, seq/N, heads*head_dim)`
    pub fn forward(
        &self,
        module: &AttentionModule,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<Tensor> {
        check_qkv(query, key, value)?;
        if self.config.gather_idx != 1 {
            return Err(UniseqError::config(format!(
                "linear attention expects the sequence on axis 1, gather_idx is {}",
                self.config.gather_idx
            )));
        }

        let (q_layer, k_layer, v_layer) = if self.config.use_pack_qkv {
            let packed = Tensor::cat(&[query, key, value], 0)?.contiguous()?;
            split_packed(&self.exchange.forward(&packed, LaneKind::InputComm)?)?
        } else {
            (
                self.exchange.forward(query, LaneKind::InputComm)?,
                self.exchange.forward(key, LaneKind::InputComm)?,
                self.exchange.forward(value, LaneKind::InputComm)?,
            )
        };

        let cache = if self.config.use_kv_cache {
            module.kv_cache().cloned()
        } else {
            None
        };
        let mut guard = cache.as_ref().map(|cache| cache.lock());
        let context = self.kernel.forward(
            &q_layer,
            &k_layer,
            &v_layer,
            self.groups.ring.as_ref(),
            guard.as_deref_mut().map(|cache| cache as &mut dyn KvCache),
        )?;
        drop(guard);

        debug!("Linear kernel {} output {:?}", self.kernel.name(), context.dims());
        let context = context.transpose(1, 2)?.contiguous()?;
        let output = self.exchange.inverse(&context, LaneKind::OutputComm)?;
        Ok(output.flatten(2, 3)?)
    }
}
