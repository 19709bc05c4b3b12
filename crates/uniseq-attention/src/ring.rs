//! Ring attention step
//!
//! Binds a kernel to the ring group and threads the caller's KV cache
//! in front of it.

use crate::kernel::{AttentionKernel, KernelArgs};
use crate::kv_cache::KvCache;
use crate::params::{AttentionParams, Descale};
use crate::processor::AttentionProcessor;
use candle_core::Tensor;
use std::sync::Arc;
use tracing::trace;
use uniseq_comm::ProcessGroup;
use uniseq_types::{AttnType, JointStrategy, Result, RingImplType, UniseqError};

/// Head-sharded, sequence-complete inputs of one ring step
#[derive(Debug, Clone, Copy)]
pub struct RingInputs<'a> {
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    /// Joint key/value already restricted to the local heads
    pub joint_key: Option<&'a Tensor>,
    pub joint_value: Option<&'a Tensor>,
    pub joint_strategy: JointStrategy,
    /// Alibi slopes of the local heads
    pub alibi_slopes: Option<&'a Tensor>,
    /// Cache slot, one per head subset
    pub cache_slot: usize,
}

impl<'a> RingInputs<'a> {
    pub fn new(query: &'a Tensor, key: &'a Tensor, value: &'a Tensor) -> Self {
        Self {
            query,
            key,
            value,
            joint_key: None,
            joint_value: None,
            joint_strategy: JointStrategy::None,
            alibi_slopes: None,
            cache_slot: 0,
        }
    }
}

/// Kernel bound to a ring group
#[derive(Clone)]
pub struct RingAttention {
    group: Arc<dyn ProcessGroup>,
    kernel: Arc<dyn AttentionKernel>,
    ring_impl: RingImplType,
    attn_type: AttnType,
    processor: Option<Arc<dyn AttentionProcessor>>,
}

impl RingAttention {
    pub fn new(
        group: Arc<dyn ProcessGroup>,
        kernel: Arc<dyn AttentionKernel>,
        ring_impl: RingImplType,
        attn_type: AttnType,
        processor: Option<Arc<dyn AttentionProcessor>>,
    ) -> Self {
        Self {
            group,
            kernel,
            ring_impl,
            attn_type,
            processor,
        }
    }

    pub fn ring_impl(&self) -> RingImplType {
        self.ring_impl
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    pub fn kernel_name(&self) -> &str {
        self.kernel.name()
    }

    /// Attend one head-sharded chunk over the ring
    pub fn run(
        &self,
        inputs: RingInputs<'_>,
        params: &AttentionParams,
        cache: Option<&mut dyn KvCache>,
        descale: &Descale,
    ) -> Result<Tensor> {
        let cached;
        let (key, value) = match cache {
            Some(cache) if self.ring_impl.supports_kv_cache() => {
                cached = cache.update_and_get(inputs.cache_slot, inputs.key, inputs.value)?;
                (&cached.0, &cached.1)
            }
            Some(_) => {
                return Err(UniseqError::config(format!(
                    "ring_impl_type: {} do not support SP kv cache.",
                    self.ring_impl
                )))
            }
            None => (inputs.key, inputs.value),
        };
        trace!(
            "ring step via {}: query {:?}, key {:?}, slot {}",
            self.kernel.name(),
            inputs.query.dims(),
            key.dims(),
            inputs.cache_slot
        );

        let output = self.kernel.forward(KernelArgs {
            query: inputs.query,
            key,
            value,
            dropout_p: params.dropout_p,
            softmax_scale: params.softmax_scale,
            causal: params.causal,
            window_size: params.window_size,
            alibi_slopes: inputs.alibi_slopes,
            deterministic: params.deterministic,
            return_attn_probs: params.return_attn_probs,
            group: self.group.as_ref(),
            attn_type: self.attn_type,
            ring_impl: self.ring_impl,
            processor: self.processor.as_deref(),
            joint_key: inputs.joint_key,
            joint_value: inputs.joint_value,
            joint_strategy: inputs.joint_strategy,
            descale,
        })?;
        // Auxiliary outputs (log-sum-exp) are not part of the layer result.
        Ok(output.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelOutput;
    use crate::kv_cache::PatchKvCache;
    use crate::reference::ReferenceAttention;
    use candle_core::{DType, Device};
    use parking_lot::Mutex;
    use uniseq_comm::LocalProcessGroup;

    /// Records the key length it was called with
    struct KeyLenKernel(Mutex<Vec<usize>>);

    impl AttentionKernel for KeyLenKernel {
        fn name(&self) -> &str {
            "key_len"
        }

        fn forward(&self, args: KernelArgs<'_>) -> Result<KernelOutput> {
            self.0.lock().push(args.key.dim(1)?);
            Ok(KernelOutput {
                context: args.query.clone(),
                softmax_lse: Some(args.query.clone()),
            })
        }
    }

    fn ones(seq: usize) -> Tensor {
        Tensor::ones((1, seq, 2, 4), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_cache_extends_keys_for_basic_ring() {
        let kernel = Arc::new(KeyLenKernel(Mutex::new(Vec::new())));
        let ring = RingAttention::new(
            Arc::new(LocalProcessGroup::solo()),
            kernel.clone(),
            RingImplType::Basic,
            AttnType::Fa,
            None,
        );
        let mut cache = PatchKvCache::new(2).unwrap();
        let params = AttentionParams::default();
        let (q, kv) = (ones(3), ones(3));
        ring.run(RingInputs::new(&q, &kv, &kv), &params, Some(&mut cache), &Descale::default())
            .unwrap();
        cache.set_patch(1).unwrap();
        let out = ring
            .run(RingInputs::new(&q, &kv, &kv), &params, Some(&mut cache), &Descale::default())
            .unwrap();
        ring.run(RingInputs::new(&q, &kv, &kv), &params, None, &Descale::default())
            .unwrap();
        assert_eq!(*kernel.0.lock(), vec![3, 6, 3]);
        assert_eq!(out.dims(), q.dims());
    }

    #[test]
    fn test_cache_refused_for_non_basic_ring() {
        let ring = RingAttention::new(
            Arc::new(LocalProcessGroup::solo()),
            Arc::new(ReferenceAttention::new()),
            RingImplType::Zigzag,
            AttnType::Fa,
            None,
        );
        let mut cache = PatchKvCache::new(1).unwrap();
        let q = ones(2);
        let err = ring
            .run(
                RingInputs::new(&q, &q, &q),
                &AttentionParams::default(),
                Some(&mut cache),
                &Descale::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("do not support SP kv cache"));
    }
}
