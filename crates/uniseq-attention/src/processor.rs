//! Attention processors
//!
//! A processor replaces the inner score/softmax/value product of the
//! kernel, e.g. with a sparse pattern. Processors see one rank's whole
//! key/value set, so sparse ones cannot be combined with a ring degree
//! above one.

use candle_core::{DType, Tensor, D};
use uniseq_types::{Result, UniseqError};

/// Replacement for the kernel's dense attention product
pub trait AttentionProcessor: Send + Sync {
    /// Processor name for logging
    fn name(&self) -> &str;

    /// Whether the processor computes a sparse attention pattern
    fn is_sparse(&self) -> bool {
        false
    }

    /// Attend `(batch, heads, seq, head_dim)` tensors
    fn attend(&self, query: &Tensor, key: &Tensor, value: &Tensor, scale: f64, causal: bool)
        -> Result<Tensor>;
}

/// Dense softmax(QK^T * scale) V
#[derive(Debug, Clone, Default)]
pub struct ScaledDotProductProcessor;

impl ScaledDotProductProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl AttentionProcessor for ScaledDotProductProcessor {
    fn name(&self) -> &str {
        "scaled_dot_product"
    }

    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        scale: f64,
        causal: bool,
    ) -> Result<Tensor> {
        let (_, _, sq, _) = query.dims4()?;
        let (_, _, sk, _) = key.dims4()?;
        let key_t = key.transpose(2, 3)?.contiguous()?;
        let mut scores = (query.matmul(&key_t)? * scale)?;
        if causal {
            if sk < sq {
                return Err(UniseqError::input_validation(format!(
                    "causal attention needs at least as many keys ({}) as queries ({})",
                    sk, sq
                )));
            }
            // Queries are aligned with the end of the key sequence.
            let offset = sk - sq;
            let mask: Vec<f32> = (0..sq)
                .flat_map(|i| {
                    (0..sk).map(move |j| {
                        if j > i + offset {
                            f32::NEG_INFINITY
                        } else {
                            0.0
                        }
                    })
                })
                .collect();
            let mask = Tensor::from_vec(mask, (1, 1, sq, sk), query.device())?
                .to_dtype(scores.dtype())?;
            scores = scores.broadcast_add(&mask)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        Ok(probs.matmul(&value.contiguous()?)?)
    }
}

/// Dense attention over only the `keep` highest-scoring keys of every query
///
/// Sparse, so it refuses a ring degree above one at layer construction.
#[derive(Debug, Clone)]
pub struct TopKSparseProcessor {
    keep: usize,
}

impl TopKSparseProcessor {
    pub fn new(keep: usize) -> Result<Self> {
        if keep == 0 {
            return Err(UniseqError::config("top-k sparse processor must keep at least one key"));
        }
        Ok(Self { keep })
    }
}

impl AttentionProcessor for TopKSparseProcessor {
    fn name(&self) -> &str {
        "top_k_sparse"
    }

    fn is_sparse(&self) -> bool {
        true
    }

    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        scale: f64,
        causal: bool,
    ) -> Result<Tensor> {
        if causal {
            return Err(UniseqError::unsupported(
                "top-k sparse processor does not support causal masking",
            ));
        }
        let key_t = key.transpose(2, 3)?.contiguous()?;
        let scores = (query.matmul(&key_t)? * scale)?.to_dtype(DType::F32)?;
        let sk = scores.dim(D::Minus1)?;
        if self.keep >= sk {
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;
            return Ok(probs.to_dtype(value.dtype())?.matmul(&value.contiguous()?)?);
        }
        // Threshold each row at its keep-th largest score.
        let sorted = scores.sort_last_dim(false)?.0;
        let threshold = sorted.narrow(D::Minus1, self.keep - 1, 1)?;
        let keep_mask = scores.broadcast_ge(&threshold)?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?;
        let masked = keep_mask.where_cond(&scores, &neg_inf)?;
        let probs = candle_nn::ops::softmax_last_dim(&masked)?;
        Ok(probs.to_dtype(value.dtype())?.matmul(&value.contiguous()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(shape: (usize, usize, usize, usize), seed: f32) -> Tensor {
        let n = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..n).map(|i| ((i as f32 + seed) * 0.37).sin()).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_dense_rows_sum_to_value_average_for_constant_scores() {
        let q = Tensor::zeros((1, 1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let k = tensor((1, 1, 3, 4), 1.0);
        let v = tensor((1, 1, 3, 4), 2.0);
        let out = ScaledDotProductProcessor::new()
            .attend(&q, &k, &v, 0.5, false)
            .unwrap();
        let mean = v.mean_keepdim(2).unwrap();
        let diff = out
            .broadcast_sub(&mean)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(3)
            .unwrap()
            .max_keepdim(2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_causal_first_query_sees_only_first_key() {
        let q = tensor((1, 2, 4, 8), 0.0);
        let k = tensor((1, 2, 4, 8), 3.0);
        let v = tensor((1, 2, 4, 8), 5.0);
        let out = ScaledDotProductProcessor::new()
            .attend(&q, &k, &v, 0.3, true)
            .unwrap();
        let first = out.narrow(2, 0, 1).unwrap();
        let expected = v.narrow(2, 0, 1).unwrap();
        let diff = (first - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_top_k_is_sparse_and_rejects_zero() {
        assert!(TopKSparseProcessor::new(0).is_err());
        let processor = TopKSparseProcessor::new(2).unwrap();
        assert!(processor.is_sparse());
        assert!(!ScaledDotProductProcessor::new().is_sparse());
    }

    #[test]
    fn test_top_k_keeping_everything_matches_dense() {
        let q = tensor((1, 2, 3, 4), 0.5);
        let k = tensor((1, 2, 5, 4), 1.5);
        let v = tensor((1, 2, 5, 4), 2.5);
        let dense = ScaledDotProductProcessor::new()
            .attend(&q, &k, &v, 0.5, false)
            .unwrap();
        let sparse = TopKSparseProcessor::new(5)
            .unwrap()
            .attend(&q, &k, &v, 0.5, false)
            .unwrap();
        let diff = (dense - sparse)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
