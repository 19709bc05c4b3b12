//! Sharded forward passes against unsharded attention over the full sequence

use candle_core::Tensor;
use std::io::Write;
use std::sync::Arc;
use uniseq::prelude::*;
use uniseq::test_utils::{
    dense_attention, init_test_env, layout_positions, max_abs_diff, run_ranks, seeded_tensor,
    select_positions,
};

const TOLERANCE: f32 = 1e-4;

#[test]
fn test_every_ring_layout_matches_dense_attention() {
    init_test_env();
    let config = HybridParallelConfig::new(2, 2).unwrap();
    let (local_len, shape) = (2, (1, 8, 4, 8));
    let q = seeded_tensor(shape, 11).unwrap();
    let k = seeded_tensor(shape, 12).unwrap();
    let v = seeded_tensor(shape, 13).unwrap();

    for ring_impl in [RingImplType::Basic, RingImplType::Zigzag, RingImplType::Strip] {
        for causal in [false, true] {
            let params = AttentionParams::default().with_causal(causal);
            let dense = dense_attention(&q, &k, &v, &params).unwrap();
            let (q, k, v) = (q.clone(), k.clone(), v.clone());
            let diffs = run_ranks(config, move |groups| {
                let rank = groups.global_rank;
                let positions = layout_positions(config, ring_impl, rank, local_len)?;
                let layer = LongContextAttention::builder(groups)
                    .config(LongContextAttentionConfig::default().with_ring_impl_type(ring_impl.to_string()))
                    .build()?;
                let lanes = LaneSet::new()?;
                let output = layer.forward(
                    &lanes,
                    &AttentionModule::new("attn"),
                    &select_positions(&q, &positions)?,
                    &select_positions(&k, &positions)?,
                    &select_positions(&v, &positions)?,
                    &params,
                )?;
                max_abs_diff(&output, &select_positions(&dense, &positions)?)
            })
            .unwrap();
            for diff in diffs {
                assert!(diff < TOLERANCE, "{} causal={} diff={}", ring_impl, causal, diff);
            }
        }
    }
}

#[test]
fn test_sequential_path_matches_dense_attention() {
    init_test_env();
    let config = HybridParallelConfig::new(4, 1).unwrap();
    let shape = (2, 8, 8, 4);
    let q = seeded_tensor(shape, 21).unwrap();
    let k = seeded_tensor(shape, 22).unwrap();
    let v = seeded_tensor(shape, 23).unwrap();
    let params = AttentionParams::default().with_causal(true).with_softmax_scale(0.3);
    let dense = dense_attention(&q, &k, &v, &params).unwrap();

    let diffs = run_ranks(config, move |groups| {
        let positions = layout_positions(config, RingImplType::Basic, groups.global_rank, 2)?;
        let layer = LongContextAttention::builder(groups)
            .config(LongContextAttentionConfig::default().with_forward_mode(ForwardMode::Sequential))
            .build()?;
        let output = layer.forward(
            &LaneSet::new()?,
            &AttentionModule::new("attn"),
            &select_positions(&q, &positions)?,
            &select_positions(&k, &positions)?,
            &select_positions(&v, &positions)?,
            &params,
        )?;
        max_abs_diff(&output, &select_positions(&dense, &positions)?)
    })
    .unwrap();
    assert!(diffs.iter().all(|&d| d < TOLERANCE), "{:?}", diffs);
}

#[test]
fn test_front_joint_attention_matches_dense_attention() {
    init_test_env();
    let config = HybridParallelConfig::new(4, 1).unwrap();
    let (local_len, joint_len) = (2, 3);
    let q = seeded_tensor((1, 8, 4, 8), 31).unwrap();
    let k = seeded_tensor((1, 8, 4, 8), 32).unwrap();
    let v = seeded_tensor((1, 8, 4, 8), 33).unwrap();
    let jq = seeded_tensor((1, joint_len, 4, 8), 34).unwrap();
    let jk = seeded_tensor((1, joint_len, 4, 8), 35).unwrap();
    let jv = seeded_tensor((1, joint_len, 4, 8), 36).unwrap();
    let params = AttentionParams::default().with_joint(Some(jq.clone()), Some(jk), Some(jv), "front");

    // Dense: joint query rows first, then the whole sequence.
    let dense = dense_attention(&Tensor::cat(&[&jq, &q], 1).unwrap(), &k, &v, &params).unwrap();

    let diffs = run_ranks(config, move |groups| {
        let rank = groups.global_rank;
        let positions = layout_positions(config, RingImplType::Basic, rank, local_len)?;
        let layer = LongContextAttention::builder(groups).build()?;
        let output = layer.forward(
            &LaneSet::new()?,
            &AttentionModule::new("attn"),
            &select_positions(&q, &positions)?,
            &select_positions(&k, &positions)?,
            &select_positions(&v, &positions)?,
            &params,
        )?;
        let expected = Tensor::cat(
            &[
                dense.narrow(1, 0, joint_len)?,
                dense.narrow(1, joint_len + rank * local_len, local_len)?,
            ],
            1,
        )?;
        max_abs_diff(&output, &expected)
    })
    .unwrap();
    assert!(diffs.iter().all(|&d| d < TOLERANCE), "{:?}", diffs);
}

#[test]
fn test_linear_attention_matches_single_process() {
    init_test_env();
    let config = HybridParallelConfig::new(2, 2).unwrap();
    let shape = (1, 8, 4, 4);
    let q = seeded_tensor(shape, 41).unwrap();
    let k = seeded_tensor(shape, 42).unwrap();
    let v = seeded_tensor(shape, 43).unwrap();

    let single = LinearLongContextAttention::new(
        HybridGroups::single(),
        LongContextAttentionConfig::default(),
        Arc::new(ReluLinearAttention::default()),
    )
    .unwrap()
    .forward(&AttentionModule::new("linear"), &q, &k, &v)
    .unwrap();
    assert_eq!(single.dims(), &[1, 8, 16]);

    for pack in [false, true] {
        let (q, k, v, single) = (q.clone(), k.clone(), v.clone(), single.clone());
        let diffs = run_ranks(config, move |groups| {
            let rank = groups.global_rank;
            let layer = LinearLongContextAttention::new(
                groups,
                LongContextAttentionConfig::default().with_pack_qkv(pack),
                Arc::new(ReluLinearAttention::default()),
            )?;
            let shard = |t: &Tensor| -> uniseq::Result<Tensor> { Ok(t.narrow(1, rank * 2, 2)?) };
            let output = layer.forward(&AttentionModule::new("linear"), &shard(&q)?, &shard(&k)?, &shard(&v)?)?;
            max_abs_diff(&output, &single.narrow(1, rank * 2, 2)?)
        })
        .unwrap();
        assert!(diffs.iter().all(|&d| d < TOLERANCE), "pack={} {:?}", pack, diffs);
    }
}

#[test]
fn test_layer_from_config_file() {
    init_test_env();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"ring_impl_type": "strip", "use_pack_qkv": true, "forward_mode": "pipelined"}}"#
    )
    .unwrap();
    let config = LongContextAttentionConfig::from_file(file.path()).unwrap();
    assert_eq!(config.ring_impl().unwrap(), RingImplType::Strip);

    let layer = LongContextAttention::builder(HybridGroups::single())
        .config(config)
        .build()
        .unwrap();
    let q = seeded_tensor((1, 6, 2, 4), 51).unwrap();
    let params = AttentionParams::default();
    let output = layer
        .forward(&LaneSet::new().unwrap(), &AttentionModule::new("attn"), &q, &q, &q, &params)
        .unwrap();
    let dense = dense_attention(&q, &q, &q, &params).unwrap();
    assert!(max_abs_diff(&output, &dense).unwrap() < TOLERANCE);
}
