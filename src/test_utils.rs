//! Test utilities and helpers
//!
//! Shared by the integration tests and benches: one-time tracing setup,
//! seeded tensors, a thread-per-rank runner over in-process groups, and an
//! unsharded reference to compare sharded results against.

use candle_core::{Device, Tensor};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;
use uniseq_attention::{AttentionKernel, AttentionParams, Descale, KernelArgs, ReferenceAttention};
use uniseq_comm::{HybridGroups, HybridTopology, LocalProcessGroup};
use uniseq_types::{
    AttnType, HybridParallelConfig, JointStrategy, Result, RingImplType, UniseqError,
};

/// Global test initialization
static TEST_INIT: Once = Once::new();

/// Receive timeout of simulated ranks, `UNISEQ_RANK_TIMEOUT_SECS` or 60 seconds
pub static RANK_TIMEOUT: Lazy<Duration> = Lazy::new(|| {
    std::env::var("UNISEQ_RANK_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60))
});

/// Initialize test environment once for all tests
pub fn init_test_env() {
    TEST_INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "error");
        }

        // Try to initialize tracing, ignore if already initialized
        let _ = tracing_subscriber::fmt()
            .with_env_filter("error")
            .with_test_writer()
            .try_init();
    });
}

/// Uniform(-1, 1) tensor from a fixed seed
pub fn seeded_tensor(shape: (usize, usize, usize, usize), seed: u64) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

/// Largest absolute element difference
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    if a.dims() != b.dims() {
        return Err(UniseqError::input_validation(format!(
            "cannot compare {:?} with {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// Global sequence positions held by `global_rank` for a ring layout
///
/// The ring layout fixes the positions of a ring rank's block; inside the
/// block, ulysses ranks hold consecutive runs of `local_len` tokens.
pub fn layout_positions(
    config: HybridParallelConfig,
    ring_impl: RingImplType,
    global_rank: usize,
    local_len: usize,
) -> Result<Vec<usize>> {
    let u = config.ulysses_rank(global_rank);
    let r = config.ring_rank(global_rank);
    let block = ring_impl.positions(r, config.ring_degree, local_len * config.ulysses_degree)?;
    block
        .get(u * local_len..(u + 1) * local_len)
        .map(<[usize]>::to_vec)
        .ok_or_else(|| {
            UniseqError::input_validation(format!(
                "rank {} with local length {} lies outside a ring block of {} tokens",
                global_rank,
                local_len,
                block.len()
            ))
        })
}

/// Rows of `full` at `positions` along the sequence axis
pub fn select_positions(full: &Tensor, positions: &[usize]) -> Result<Tensor> {
    let index: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
    let index = Tensor::from_vec(index, positions.len(), full.device())?;
    Ok(full.index_select(&index, 1)?.contiguous()?)
}

/// Run `f` once per global rank on its own thread
pub fn run_ranks<T, F>(config: HybridParallelConfig, f: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(HybridGroups) -> Result<T> + Send + Sync + 'static,
{
    let groups = HybridTopology::build_with_timeout(config, Some(*RANK_TIMEOUT))?;
    let f = Arc::new(f);
    let handles: Vec<_> = groups
        .into_iter()
        .map(|groups| {
            let f = Arc::clone(&f);
            thread::Builder::new()
                .name(format!("rank-{}", groups.global_rank))
                .spawn(move || f(groups))
                .map_err(UniseqError::from)
        })
        .collect::<Result<_>>()?;
    handles
        .into_iter()
        .enumerate()
        .map(|(rank, handle)| {
            handle
                .join()
                .map_err(|_| UniseqError::internal(format!("rank {} panicked", rank)))?
        })
        .collect()
}

/// Unsharded attention over the full sequence
///
/// Joint key/value in `params` are attended as an always-visible block; a
/// joint query must already be part of `query`.
pub fn dense_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    params: &AttentionParams,
) -> Result<Tensor> {
    let group = LocalProcessGroup::solo();
    let descale = Descale::default();
    let joint_strategy = match (&params.joint_key, &params.joint_value) {
        (Some(_), Some(_)) => params.joint_strategy.parse()?,
        _ => JointStrategy::None,
    };
    let output = ReferenceAttention::new().forward(KernelArgs {
        query,
        key,
        value,
        dropout_p: params.dropout_p,
        softmax_scale: params.softmax_scale,
        causal: params.causal,
        window_size: params.window_size,
        alibi_slopes: params.alibi_slopes.as_ref(),
        deterministic: params.deterministic,
        return_attn_probs: false,
        group: &group,
        attn_type: AttnType::Torch,
        ring_impl: RingImplType::Basic,
        processor: None,
        joint_key: params.joint_key.as_ref(),
        joint_value: params.joint_value.as_ref(),
        joint_strategy,
        descale: &descale,
    })?;
    Ok(output.context)
}
