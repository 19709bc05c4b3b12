//! Hybrid Ulysses + Ring attention layer
//!
//! The layer owns the exchange and ring step of one rank. A forward call
//! runs either the pipelined driver, which overlaps head exchanges with
//! attention chunk by chunk over three lanes, or the sequential path that
//! exchanges all heads at once.

use crate::joint::JointInputs;
use crate::kernel::AttentionKernel;
use crate::kv_cache::{AttentionModule, KvCache, SharedKvCache};
use crate::params::{AttentionParams, Descale};
use crate::pipeline::{PipelineDriver, PipelineReport};
use crate::processor::AttentionProcessor;
use crate::reference::ReferenceAttention;
use crate::ring::{RingAttention, RingInputs};
use candle_core::Tensor;
use std::sync::Arc;
use tracing::{debug, info};
use uniseq_comm::{HeadExchange, HeadRange, HybridGroups};
use uniseq_runtime::LaneSet;
use uniseq_types::{
    ForwardMode, LaneKind, LongContextAttentionConfig, Result, RingImplType, UniseqError,
};

/// Long-context attention over a hybrid ulysses x ring topology
pub struct LongContextAttention {
    pub(crate) config: LongContextAttentionConfig,
    pub(crate) ring_impl: RingImplType,
    pub(crate) groups: HybridGroups,
    pub(crate) exchange: HeadExchange,
    pub(crate) ring: RingAttention,
    pub(crate) descale: Descale,
}

/// Builder for [`LongContextAttention`]
pub struct LongContextAttentionBuilder {
    groups: HybridGroups,
    config: LongContextAttentionConfig,
    kernel: Option<Arc<dyn AttentionKernel>>,
    processor: Option<Arc<dyn AttentionProcessor>>,
    descale: Descale,
}

impl LongContextAttentionBuilder {
    /// Layer configuration, defaults otherwise
    pub fn config(mut self, config: LongContextAttentionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attention kernel, [`ReferenceAttention`] otherwise
    pub fn kernel(mut self, kernel: Arc<dyn AttentionKernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Processor override forwarded to the kernel
    pub fn processor(mut self, processor: Arc<dyn AttentionProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Descale factors forwarded on every kernel call
    pub fn descale(mut self, descale: Descale) -> Self {
        self.descale = descale;
        self
    }

    pub fn build(self) -> Result<LongContextAttention> {
        self.config.validate()?;
        let ring_impl = self.config.ring_impl()?;

        if let Some(processor) = &self.processor {
            if processor.is_sparse() && self.groups.ring_size() > 1 {
                return Err(UniseqError::config(format!(
                    "Sparse attention processor {} is not supported with ring degree {} > 1",
                    processor.name(),
                    self.groups.ring_size()
                )));
            }
        }

        let kernel = self
            .kernel
            .unwrap_or_else(|| Arc::new(ReferenceAttention::new()));
        let exchange = HeadExchange::new(
            Arc::clone(&self.groups.ulysses),
            self.config.scatter_idx,
            self.config.gather_idx,
        );
        let ring = RingAttention::new(
            Arc::clone(&self.groups.ring),
            Arc::clone(&kernel),
            ring_impl,
            self.config.attn_type,
            self.processor,
        );

        info!(
            "Long-context attention on rank {}: ulysses {} x ring {} ({}, kernel {}, {})",
            self.groups.global_rank,
            self.groups.ulysses_size(),
            self.groups.ring_size(),
            ring_impl,
            kernel.name(),
            self.config.attn_type
        );

        Ok(LongContextAttention {
            config: self.config,
            ring_impl,
            groups: self.groups,
            exchange,
            ring,
            descale: self.descale,
        })
    }
}

impl LongContextAttention {
    pub fn builder(groups: HybridGroups) -> LongContextAttentionBuilder {
        LongContextAttentionBuilder {
            groups,
            config: LongContextAttentionConfig::default(),
            kernel: None,
            processor: None,
            descale: Descale::default(),
        }
    }

    pub fn config(&self) -> &LongContextAttentionConfig {
        &self.config
    }

    pub fn ring_impl(&self) -> RingImplType {
        self.ring_impl
    }

    pub fn groups(&self) -> &HybridGroups {
        &self.groups
    }

    /// Number of head chunks the pipelined path splits `num_heads` into
    pub fn num_chunks(&self, num_heads: usize) -> Result<usize> {
        let ulysses = self.groups.ulysses_size();
        if num_heads == 0 || num_heads % ulysses != 0 {
            return Err(UniseqError::config(format!(
                "{} heads cannot be pipelined over a ulysses group of {}",
                num_heads, ulysses
            )));
        }
        Ok(num_heads / ulysses)
    }

    /// Attention over the sequence-sharded `query`, `key` and `value`
    ///
    /// Inputs are `(batch, seq/N, heads, head_dim)`; the output has the
    /// query's layout, extended by the joint length when joint tensors are
    /// given.
    pub fn forward(
        &self,
        lanes: &LaneSet,
        module: &AttentionModule,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        params: &AttentionParams,
    ) -> Result<Tensor> {
        let heads = check_qkv(query, key, value)?;
        match self.config.forward_mode {
            ForwardMode::Sequential => self.forward_sequential(module, query, key, value, params),
            ForwardMode::Pipelined => {
                self.forward_pipelined(lanes, module, query, key, value, params)
            }
            ForwardMode::Auto => {
                if heads % self.groups.ulysses_size() == 0 {
                    self.forward_pipelined(lanes, module, query, key, value, params)
                } else {
                    debug!(
                        "{} heads do not divide into ulysses chunks, using sequential path",
                        heads
                    );
                    self.forward_sequential(module, query, key, value, params)
                }
            }
        }
    }

    /// Pipelined forward over the three lanes
    pub fn forward_pipelined(
        &self,
        lanes: &LaneSet,
        module: &AttentionModule,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        params: &AttentionParams,
    ) -> Result<Tensor> {
        self.forward_pipelined_with_report(lanes, module, query, key, value, params)
            .map(|(output, _)| output)
    }

    /// [`Self::forward_pipelined`] returning the driver's slot audit as well
    pub fn forward_pipelined_with_report(
        &self,
        lanes: &LaneSet,
        module: &AttentionModule,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, PipelineReport)> {
        check_qkv(query, key, value)?;
        PipelineDriver::new(self, lanes).run(module, query, key, value, params)
    }

    /// Exchange all heads, attend once, exchange back
    pub fn forward_sequential(
        &self,
        module: &AttentionModule,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        params: &AttentionParams,
    ) -> Result<Tensor> {
        let heads = check_qkv(query, key, value)?;
        let joint = JointInputs::from_params(params)?;
        let query = match &joint {
            Some(joint) => joint.concat_query(query)?,
            None => query.clone(),
        };

        let (q_layer, k_layer, v_layer) = self.exchange_qkv(&query, key, value, LaneKind::InputComm)?;

        let range = HeadRange::for_rank(
            heads,
            self.groups.ulysses_size(),
            self.groups.ulysses.rank(),
        )?;
        let joint_kv = joint.as_ref().map(|j| j.slice_heads(range)).transpose()?;
        let alibi = params
            .alibi_slopes
            .as_ref()
            .map(|slopes| range.slice(slopes, 0))
            .transpose()?;

        let cache = self.cache_for(module);
        let mut guard = cache.as_ref().map(|cache| cache.lock());
        let context = self.ring.run(
            RingInputs {
                query: &q_layer,
                key: &k_layer,
                value: &v_layer,
                joint_key: joint_kv.as_ref().map(|(k, _)| k),
                joint_value: joint_kv.as_ref().map(|(_, v)| v),
                joint_strategy: joint.as_ref().map(|j| j.strategy()).unwrap_or_default(),
                alibi_slopes: alibi.as_ref(),
                cache_slot: 0,
            },
            params,
            guard.as_deref_mut().map(|cache| cache as &mut dyn KvCache),
            &self.descale,
        )?;
        drop(guard);

        self.exchange.inverse(&context, LaneKind::OutputComm)
    }

    /// Sequence-sharded q/k/v to head-sharded, packed when shapes allow
    pub(crate) fn exchange_qkv(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        channel: LaneKind,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        if self.config.use_pack_qkv && query.dims() == key.dims() {
            let packed = Tensor::cat(&[query, key, value], 0)?.contiguous()?;
            let exchanged = self.exchange.forward(&packed, channel)?;
            split_packed(&exchanged)
        } else {
            Ok((
                self.exchange.forward(query, channel)?,
                self.exchange.forward(key, channel)?,
                self.exchange.forward(value, channel)?,
            ))
        }
    }

    /// The module's cache when the layer runs in cache mode
    pub(crate) fn cache_for(&self, module: &AttentionModule) -> Option<SharedKvCache> {
        if self.config.use_kv_cache {
            module.kv_cache().cloned()
        } else {
            None
        }
    }
}

/// Split a packed `(3*batch, ...)` tensor into its query/key/value thirds
pub(crate) fn split_packed(packed: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let parts = packed.chunk(3, 0)?;
    match <[Tensor; 3]>::try_from(parts) {
        Ok([q, k, v]) => Ok((q, k, v)),
        Err(parts) => Err(UniseqError::internal(format!(
            "packed qkv split into {} parts",
            parts.len()
        ))),
    }
}

/// Check the q/k/v layout and return the head count
pub(crate) fn check_qkv(query: &Tensor, key: &Tensor, value: &Tensor) -> Result<usize> {
    let (qb, _, qh, qd) = query.dims4().map_err(|_| {
        UniseqError::input_validation(format!(
            "query must be (batch, seq, heads, head_dim), got {:?}",
            query.dims()
        ))
    })?;
    let kv = key.dims4().map_err(|_| {
        UniseqError::input_validation(format!(
            "key must be (batch, seq, heads, head_dim), got {:?}",
            key.dims()
        ))
    })?;
    if value.dims() != key.dims() || kv.0 != qb || kv.2 != qh || kv.3 != qd {
        return Err(UniseqError::input_validation(format!(
            "query {:?}, key {:?} and value {:?} do not agree",
            query.dims(),
            key.dims(),
            value.dims()
        )));
    }
    Ok(qh)
}
