//! CPU reference ring attention kernel
//!
//! Exact attention in candle. Each ring step attends the local query to
//! the key/value block currently held, merges the partial result with a
//! running online softmax, then passes the block to the next ring rank.
//! Masks are built from the global positions the ring layout assigns to
//! every local token, so causal, window and alibi biases are identical to
//! unsharded attention over the same global sequence.

use crate::kernel::{AttentionKernel, KernelArgs, KernelOutput};
use candle_core::{DType, Device, Tensor, D};
use tracing::trace;
use uniseq_comm::ProcessGroup;
use uniseq_types::{JointStrategy, LaneKind, Result, UniseqError};

/// Exact attention over the ring, `(batch, seq, heads, head_dim)` layout
#[derive(Debug, Clone, Default)]
pub struct ReferenceAttention;

impl ReferenceAttention {
    pub fn new() -> Self {
        Self
    }
}

impl AttentionKernel for ReferenceAttention {
    fn name(&self) -> &str {
        "reference"
    }

    fn forward(&self, args: KernelArgs<'_>) -> Result<KernelOutput> {
        if args.dropout_p > 0.0 {
            return Err(UniseqError::unsupported(format!(
                "reference kernel is inference only, dropout_p {} requested",
                args.dropout_p
            )));
        }
        let (batch, sq, heads, head_dim) = args.query.dims4()?;
        let (kb, sk, kh, kd) = args.key.dims4()?;
        if kb != batch || kh != heads || kd != head_dim || args.value.dims4()? != (kb, sk, kh, kd) {
            return Err(UniseqError::kernel(format!(
                "query {:?} does not match key {:?} / value {:?}",
                args.query.dims(),
                args.key.dims(),
                args.value.dims()
            )));
        }
        let out_dtype = args.query.dtype();
        let scale = args
            .softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f64).sqrt());

        let query = to_heads_first(&descaled(args.query, args.descale.q.as_ref())?)?;
        let key = to_heads_first(&descaled(args.key, args.descale.k.as_ref())?)?;
        let value = to_heads_first(&descaled(args.value, args.descale.v.as_ref())?)?;
        let joint = match (args.joint_key, args.joint_value) {
            (Some(jk), Some(jv)) => Some((
                to_heads_first(&descaled(jk, args.descale.k.as_ref())?)?,
                to_heads_first(&descaled(jv, args.descale.v.as_ref())?)?,
            )),
            (None, None) => None,
            _ => {
                return Err(UniseqError::kernel(
                    "joint key and joint value must be passed together",
                ))
            }
        };

        let ring = args.group;
        let (ring_rank, ring_size) = (ring.rank(), ring.world_size());

        if let Some(processor) = args.processor {
            if ring_size > 1 {
                return Err(UniseqError::unsupported(format!(
                    "processor {} cannot run across a ring of {} ranks",
                    processor.name(),
                    ring_size
                )));
            }
            let (key, value) = match &joint {
                Some((jk, jv)) => join_kv(&key, &value, jk, jv, args.joint_strategy)?,
                None => (key, value),
            };
            let context = processor.attend(&query, &key, &value, scale, args.causal)?;
            let context = from_heads_first(&context)?.to_dtype(out_dtype)?;
            return Ok(KernelOutput::context_only(context));
        }

        let slopes = match args.alibi_slopes {
            Some(slopes) => {
                let slopes = slopes.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                if slopes.len() != heads {
                    return Err(UniseqError::kernel(format!(
                        "{} alibi slopes for {} local heads",
                        slopes.len(),
                        heads
                    )));
                }
                Some(slopes)
            }
            None => None,
        };
        let masks = MaskSpec {
            causal: args.causal,
            window: args.window_size,
            slopes,
        };

        let device = query.device().clone();
        let q_pos = args.ring_impl.positions(ring_rank, ring_size, sq)?;
        let mut acc = OnlineSoftmax::new(batch, heads, sq, head_dim, &device)?;

        // Joint blocks are replicated on every rank and always visible.
        if let Some((jk, jv)) = &joint {
            acc.update(&query, jk, jv, scale, None)?;
        }

        let (mut block_k, mut block_v) = (key, value);
        for step in 0..ring_size {
            let src = (ring_rank + ring_size - step) % ring_size;
            let k_pos = args.ring_impl.positions(src, ring_size, block_k.dim(2)?)?;
            let bias = masks.bias(&q_pos, &k_pos, &device)?;
            trace!(
                "ring step {}/{} on rank {}: block from {}",
                step + 1,
                ring_size,
                ring_rank,
                src
            );
            acc.update(&query, &block_k, &block_v, scale, bias.as_ref())?;
            if step + 1 < ring_size {
                block_k = ring_pass(ring, &block_k)?;
                block_v = ring_pass(ring, &block_v)?;
            }
        }

        let (context, lse) = acc.finish()?;
        let context = from_heads_first(&context)?.to_dtype(out_dtype)?;
        Ok(KernelOutput {
            context,
            softmax_lse: if args.return_attn_probs { Some(lse) } else { None },
        })
    }
}

fn descaled(tensor: &Tensor, scale: Option<&Tensor>) -> Result<Tensor> {
    let tensor = tensor.to_dtype(DType::F32)?;
    match scale {
        Some(scale) => Ok(tensor.broadcast_mul(&scale.to_dtype(DType::F32)?)?),
        None => Ok(tensor),
    }
}

fn to_heads_first(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.transpose(1, 2)?.contiguous()?)
}

fn from_heads_first(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.transpose(1, 2)?.contiguous()?)
}

fn join_kv(
    key: &Tensor,
    value: &Tensor,
    joint_key: &Tensor,
    joint_value: &Tensor,
    strategy: JointStrategy,
) -> Result<(Tensor, Tensor)> {
    match strategy {
        JointStrategy::Front => Ok((
            Tensor::cat(&[joint_key, key], 2)?,
            Tensor::cat(&[joint_value, value], 2)?,
        )),
        _ => Ok((
            Tensor::cat(&[key, joint_key], 2)?,
            Tensor::cat(&[value, joint_value], 2)?,
        )),
    }
}

/// Send `block` to the next ring rank and receive the previous rank's
fn ring_pass(group: &dyn ProcessGroup, block: &Tensor) -> Result<Tensor> {
    let (rank, size) = (group.rank(), group.world_size());
    let next = (rank + 1) % size;
    let prev = (rank + size - 1) % size;
    group.send(block, next, LaneKind::Compute)?;
    group.recv(prev, LaneKind::Compute)
}

struct MaskSpec {
    causal: bool,
    window: (i64, i64),
    slopes: Option<Vec<f32>>,
}

impl MaskSpec {
    /// Additive bias `(1, heads|1, sq, sk)` for a query/key position pair
    fn bias(&self, q_pos: &[usize], k_pos: &[usize], device: &Device) -> Result<Option<Tensor>> {
        let windowed = self.window.0 >= 0 || self.window.1 >= 0;
        if !self.causal && !windowed && self.slopes.is_none() {
            return Ok(None);
        }
        let (sq, sk) = (q_pos.len(), k_pos.len());
        let mut mask = Vec::with_capacity(sq * sk);
        let mut distance = Vec::with_capacity(sq * sk);
        for &qp in q_pos {
            for &kp in k_pos {
                let (qi, ki) = (qp as i64, kp as i64);
                let hidden = (self.causal && ki > qi)
                    || (self.window.0 >= 0 && ki < qi - self.window.0)
                    || (self.window.1 >= 0 && ki > qi + self.window.1);
                mask.push(if hidden { f32::NEG_INFINITY } else { 0.0 });
                distance.push(-((qi - ki).abs() as f32));
            }
        }
        let mut bias = Tensor::from_vec(mask, (1, 1, sq, sk), device)?;
        if let Some(slopes) = &self.slopes {
            let heads = slopes.len();
            let slopes = Tensor::from_vec(slopes.clone(), (1, heads, 1, 1), device)?;
            let distance = Tensor::from_vec(distance, (1, 1, sq, sk), device)?;
            bias = slopes.broadcast_mul(&distance)?.broadcast_add(&bias)?;
        }
        Ok(Some(bias))
    }
}

/// Running softmax state merged block by block
struct OnlineSoftmax {
    /// Unnormalised context `(b, h, sq, d)`
    out: Tensor,
    /// Running row max `(b, h, sq, 1)`, never below `f32::MIN`
    max: Tensor,
    /// Running row sum of exponentials `(b, h, sq, 1)`
    sum: Tensor,
}

impl OnlineSoftmax {
    fn new(batch: usize, heads: usize, sq: usize, head_dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            out: Tensor::zeros((batch, heads, sq, head_dim), DType::F32, device)?,
            max: Tensor::full(f32::MIN, (batch, heads, sq, 1), device)?,
            sum: Tensor::zeros((batch, heads, sq, 1), DType::F32, device)?,
        })
    }

    fn update(
        &mut self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        scale: f64,
        bias: Option<&Tensor>,
    ) -> Result<()> {
        let key_t = key.transpose(2, 3)?.contiguous()?;
        let mut scores = (query.matmul(&key_t)? * scale)?;
        if let Some(bias) = bias {
            scores = scores.broadcast_add(bias)?;
        }
        // A fully masked row keeps the previous max, so exp() below never sees inf - inf.
        let block_max = scores.max_keepdim(D::Minus1)?;
        let new_max = self.max.maximum(&block_max)?;
        let correction = (&self.max - &new_max)?.exp()?;
        let probs = scores.broadcast_sub(&new_max)?.exp()?;
        let block_sum = probs.sum_keepdim(D::Minus1)?;
        self.out = (self.out.broadcast_mul(&correction)? + probs.matmul(value)?)?;
        self.sum = ((&self.sum * &correction)? + block_sum)?;
        self.max = new_max;
        Ok(())
    }

    /// Normalised context and log-sum-exp `(b, h, sq)`
    fn finish(self) -> Result<(Tensor, Tensor)> {
        let denom = self.sum.maximum(f32::MIN_POSITIVE)?;
        let context = self.out.broadcast_div(&denom)?;
        let lse = (self.max + self.sum.log()?)?.squeeze(D::Minus1)?;
        Ok((context, lse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Descale;
    use crate::processor::{AttentionProcessor, ScaledDotProductProcessor};
    use std::sync::Arc;
    use std::thread;
    use uniseq_comm::LocalProcessGroup;
    use uniseq_types::{AttnType, RingImplType};

    fn tensor(shape: (usize, usize, usize, usize), seed: f32) -> Tensor {
        let n = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..n).map(|i| ((i as f32 * 0.61 + seed) * 1.3).sin()).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn args<'a>(
        q: &'a Tensor,
        k: &'a Tensor,
        v: &'a Tensor,
        group: &'a dyn ProcessGroup,
        ring_impl: RingImplType,
        causal: bool,
        descale: &'a Descale,
    ) -> KernelArgs<'a> {
        KernelArgs {
            query: q,
            key: k,
            value: v,
            dropout_p: 0.0,
            softmax_scale: None,
            causal,
            window_size: (-1, -1),
            alibi_slopes: None,
            deterministic: false,
            return_attn_probs: false,
            group,
            attn_type: AttnType::Torch,
            ring_impl,
            processor: None,
            joint_key: None,
            joint_value: None,
            joint_strategy: JointStrategy::None,
            descale,
        }
    }

    /// Dense attention in `(b, s, h, d)` layout
    fn dense(q: &Tensor, k: &Tensor, v: &Tensor, causal: bool) -> Tensor {
        let (_, _, _, d) = q.dims4().unwrap();
        let out = ScaledDotProductProcessor::new()
            .attend(
                &to_heads_first(q).unwrap(),
                &to_heads_first(k).unwrap(),
                &to_heads_first(v).unwrap(),
                1.0 / (d as f64).sqrt(),
                causal,
            )
            .unwrap();
        from_heads_first(&out).unwrap()
    }

    #[test]
    fn test_single_rank_matches_dense() {
        let group = LocalProcessGroup::solo();
        let descale = Descale::default();
        let (q, k, v) = (tensor((2, 6, 3, 4), 0.0), tensor((2, 6, 3, 4), 1.0), tensor((2, 6, 3, 4), 2.0));
        for causal in [false, true] {
            let out = ReferenceAttention::new()
                .forward(args(&q, &k, &v, &group, RingImplType::Basic, causal, &descale))
                .unwrap();
            assert!(max_diff(&out.context, &dense(&q, &k, &v, causal)) < 1e-5);
            assert!(out.softmax_lse.is_none());
        }
    }

    #[test]
    fn test_ring_of_two_matches_dense_for_every_layout() {
        let (q, k, v) = (tensor((1, 8, 2, 4), 0.3), tensor((1, 8, 2, 4), 1.7), tensor((1, 8, 2, 4), 2.9));
        for ring_impl in [RingImplType::Basic, RingImplType::Zigzag, RingImplType::Strip] {
            for causal in [false, true] {
                let groups = LocalProcessGroup::new_group(2).unwrap();
                let handles: Vec<_> = groups
                    .into_iter()
                    .map(|group| {
                        let (q, k, v) = (q.clone(), k.clone(), v.clone());
                        thread::spawn(move || {
                            let rank = group.rank();
                            let pos = ring_impl.positions(rank, 2, 4).unwrap();
                            let idx = Tensor::from_vec(
                                pos.iter().map(|&p| p as u32).collect::<Vec<_>>(),
                                4,
                                &Device::Cpu,
                            )
                            .unwrap();
                            let shard = |t: &Tensor| t.index_select(&idx, 1).unwrap();
                            let (lq, lk, lv) = (shard(&q), shard(&k), shard(&v));
                            let descale = Descale::default();
                            let out = ReferenceAttention::new()
                                .forward(args(&lq, &lk, &lv, &group, ring_impl, causal, &descale))
                                .unwrap();
                            (idx, out.context)
                        })
                    })
                    .collect();
                let full = dense(&q, &k, &v, causal);
                for handle in handles {
                    let (idx, context) = handle.join().unwrap();
                    let expected = full.index_select(&idx, 1).unwrap();
                    assert!(
                        max_diff(&context, &expected) < 1e-5,
                        "{} causal={} diverged",
                        ring_impl,
                        causal
                    );
                }
            }
        }
    }

    #[test]
    fn test_dropout_is_unsupported() {
        let group = LocalProcessGroup::solo();
        let descale = Descale::default();
        let q = tensor((1, 2, 1, 4), 0.0);
        let mut a = args(&q, &q, &q, &group, RingImplType::Basic, false, &descale);
        a.dropout_p = 0.1;
        let err = ReferenceAttention::new().forward(a).unwrap_err();
        assert!(matches!(err, UniseqError::Unsupported { .. }));
    }

    #[test]
    fn test_window_zero_attends_only_itself() {
        let group = LocalProcessGroup::solo();
        let descale = Descale::default();
        let (q, k, v) = (tensor((1, 5, 2, 4), 0.0), tensor((1, 5, 2, 4), 1.0), tensor((1, 5, 2, 4), 2.0));
        let mut a = args(&q, &k, &v, &group, RingImplType::Basic, false, &descale);
        a.window_size = (0, 0);
        let out = ReferenceAttention::new().forward(a).unwrap();
        assert!(max_diff(&out.context, &v) < 1e-6);
    }

    #[test]
    fn test_return_attn_probs_yields_lse() {
        let group = LocalProcessGroup::solo();
        let descale = Descale::default();
        let q = Tensor::zeros((1, 3, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let kv = tensor((1, 3, 2, 4), 1.0);
        let mut a = args(&q, &kv, &kv, &group, RingImplType::Basic, false, &descale);
        a.return_attn_probs = true;
        let lse = ReferenceAttention::new().forward(a).unwrap().softmax_lse.unwrap();
        assert_eq!(lse.dims(), &[1, 2, 3]);
        // Zero scores: lse = ln(number of keys)
        let expected = (3.0f32).ln();
        for value in lse.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((value - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_descale_scales_values() {
        let group = LocalProcessGroup::solo();
        let q = tensor((1, 4, 1, 4), 0.0);
        let k = tensor((1, 4, 1, 4), 1.0);
        let v = tensor((1, 4, 1, 4), 2.0);
        let plain = Descale::default();
        let doubled = Descale::new(None, None, Some(Tensor::new(2.0f32, &Device::Cpu).unwrap()));
        let base = ReferenceAttention::new()
            .forward(args(&q, &k, &v, &group, RingImplType::Basic, false, &plain))
            .unwrap()
            .context;
        let scaled = ReferenceAttention::new()
            .forward(args(&q, &k, &v, &group, RingImplType::Basic, false, &doubled))
            .unwrap()
            .context;
        assert!(max_diff(&(base * 2.0).unwrap(), &scaled) < 1e-5);
    }

    #[test]
    fn test_joint_block_matches_concatenated_dense() {
        let group = LocalProcessGroup::solo();
        let descale = Descale::default();
        let (q, k, v) = (tensor((1, 4, 2, 4), 0.2), tensor((1, 4, 2, 4), 1.2), tensor((1, 4, 2, 4), 2.2));
        let (jk, jv) = (tensor((1, 2, 2, 4), 3.2), tensor((1, 2, 2, 4), 4.2));
        let mut a = args(&q, &k, &v, &group, RingImplType::Basic, false, &descale);
        a.joint_key = Some(&jk);
        a.joint_value = Some(&jv);
        a.joint_strategy = JointStrategy::Rear;
        let out = ReferenceAttention::new().forward(a).unwrap();
        let expected = dense(
            &q,
            &Tensor::cat(&[&k, &jk], 1).unwrap(),
            &Tensor::cat(&[&v, &jv], 1).unwrap(),
            false,
        );
        assert!(max_diff(&out.context, &expected) < 1e-5);
    }

    #[test]
    fn test_processor_refused_on_multi_rank_ring() {
        let groups = LocalProcessGroup::new_group(2).unwrap();
        let processor: Arc<dyn crate::processor::AttentionProcessor> =
            Arc::new(ScaledDotProductProcessor::new());
        let descale = Descale::default();
        let q = tensor((1, 2, 1, 4), 0.0);
        let mut a = args(&q, &q, &q, &groups[0], RingImplType::Basic, false, &descale);
        a.processor = Some(processor.as_ref());
        let err = ReferenceAttention::new().forward(a).unwrap_err();
        assert!(matches!(err, UniseqError::Unsupported { .. }));
    }
}
