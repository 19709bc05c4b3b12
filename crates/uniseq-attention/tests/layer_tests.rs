//! Construction guards and call-time validation of the attention layer

use candle_core::{DType, Device, Tensor};
use std::sync::Arc;
use uniseq_attention::{
    AttentionModule, AttentionParams, LongContextAttention, ScaledDotProductProcessor,
    TopKSparseProcessor,
};
use uniseq_comm::{HybridGroups, HybridTopology};
use uniseq_runtime::LaneSet;
use uniseq_types::{ForwardMode, HybridParallelConfig, LongContextAttentionConfig, UniseqError};

fn zeros(seq: usize, heads: usize) -> Tensor {
    Tensor::zeros((1, seq, heads, 4), DType::F32, &Device::Cpu).unwrap()
}

fn single_layer(config: LongContextAttentionConfig) -> LongContextAttention {
    LongContextAttention::builder(HybridGroups::single())
        .config(config)
        .build()
        .unwrap()
}

#[test]
fn test_kv_cache_with_unknown_ring_fails_at_construction() {
    let config = LongContextAttentionConfig::default()
        .with_ring_impl_type("other")
        .with_kv_cache(true);
    let err = LongContextAttention::builder(HybridGroups::single())
        .config(config)
        .build()
        .err()
        .unwrap();
    assert!(err.is_configuration_error());
}

#[test]
fn test_kv_cache_with_zigzag_ring_fails_at_construction() {
    let config = LongContextAttentionConfig::default()
        .with_ring_impl_type("zigzag")
        .with_kv_cache(true);
    let err = LongContextAttention::builder(HybridGroups::single())
        .config(config)
        .build()
        .err()
        .unwrap();
    assert_eq!(
        err.to_string(),
        "Configuration error: ring_impl_type: zigzag do not support SP kv cache."
    );
}

#[test]
fn test_every_ring_layout_builds_without_cache() {
    for name in ["basic", "zigzag", "strip"] {
        let layer = single_layer(LongContextAttentionConfig::default().with_ring_impl_type(name));
        assert_eq!(layer.ring_impl().to_string(), name);
    }
}

#[test]
fn test_sparse_processor_refused_on_ring() {
    let groups = HybridTopology::build(HybridParallelConfig::new(1, 2).unwrap()).unwrap();
    let err = LongContextAttention::builder(groups[0].clone())
        .processor(Arc::new(TopKSparseProcessor::new(2).unwrap()))
        .build()
        .err()
        .unwrap();
    assert!(err.is_configuration_error());

    // Dense processors and sparse ones without a ring are fine
    assert!(LongContextAttention::builder(groups[1].clone())
        .processor(Arc::new(ScaledDotProductProcessor::new()))
        .build()
        .is_ok());
    assert!(LongContextAttention::builder(HybridGroups::single())
        .processor(Arc::new(TopKSparseProcessor::new(2).unwrap()))
        .build()
        .is_ok());
}

#[test]
fn test_invalid_exchange_axes_rejected() {
    let config = LongContextAttentionConfig {
        scatter_idx: 1,
        gather_idx: 1,
        ..LongContextAttentionConfig::default()
    };
    let err = LongContextAttention::builder(HybridGroups::single())
        .config(config)
        .build()
        .err()
        .unwrap();
    assert!(err.is_configuration_error());
}

#[test]
fn test_partial_joint_tensors_rejected_on_both_paths() {
    let lanes = LaneSet::new().unwrap();
    let module = AttentionModule::new("attn");
    let q = zeros(4, 2);
    let joint = zeros(2, 2);
    let partials = [
        (Some(joint.clone()), None, None),
        (Some(joint.clone()), Some(joint.clone()), None),
        (None, Some(joint.clone()), Some(joint.clone())),
    ];
    for mode in [ForwardMode::Pipelined, ForwardMode::Sequential] {
        let layer = single_layer(LongContextAttentionConfig::default().with_forward_mode(mode));
        for (jq, jk, jv) in partials.iter().cloned() {
            let params = AttentionParams::default().with_joint(jq, jk, jv, "rear");
            let err = layer
                .forward(&lanes, &module, &q, &q, &q, &params)
                .unwrap_err();
            assert!(matches!(err, UniseqError::InputValidation { .. }), "{:?}", err);
        }
    }
}

#[test]
fn test_unknown_joint_strategy_rejected() {
    let lanes = LaneSet::new().unwrap();
    let layer = single_layer(LongContextAttentionConfig::default());
    let q = zeros(4, 2);
    let joint = zeros(2, 2);
    let params = AttentionParams::default().with_joint(
        Some(joint.clone()),
        Some(joint.clone()),
        Some(joint),
        "middle",
    );
    let err = layer
        .forward(&lanes, &AttentionModule::new("attn"), &q, &q, &q, &params)
        .unwrap_err();
    assert!(err.is_input_error());
    assert!(err.to_string().contains("middle"));
}

#[test]
fn test_front_joint_segment_leads_output() {
    let lanes = LaneSet::new().unwrap();
    let layer = single_layer(LongContextAttentionConfig::default());
    let q = zeros(3, 2);
    let joint = Tensor::ones((1, 2, 2, 4), DType::F32, &Device::Cpu).unwrap();
    let params = AttentionParams::default().with_joint(
        Some(joint.clone()),
        Some(joint.clone()),
        Some(joint),
        "front",
    );
    let out = layer
        .forward(&lanes, &AttentionModule::new("attn"), &q, &q, &q, &params)
        .unwrap();
    assert_eq!(out.dims(), &[1, 5, 2, 4]);
}

#[test]
fn test_pipelined_mode_needs_divisible_heads() {
    let groups = HybridTopology::build(HybridParallelConfig::new(2, 1).unwrap()).unwrap();
    let layer = LongContextAttention::builder(groups[0].clone())
        .config(LongContextAttentionConfig::default().with_forward_mode(ForwardMode::Pipelined))
        .build()
        .unwrap();
    // Fails before any collective is issued, so the peer rank is not needed.
    let err = layer
        .forward(
            &LaneSet::new().unwrap(),
            &AttentionModule::new("attn"),
            &zeros(2, 3),
            &zeros(2, 3),
            &zeros(2, 3),
            &AttentionParams::default(),
        )
        .unwrap_err();
    assert!(err.is_configuration_error());
}

#[test]
fn test_mismatched_inputs_rejected() {
    let layer = single_layer(LongContextAttentionConfig::default());
    let err = layer
        .forward(
            &LaneSet::new().unwrap(),
            &AttentionModule::new("attn"),
            &zeros(4, 2),
            &zeros(4, 3),
            &zeros(4, 3),
            &AttentionParams::default(),
        )
        .unwrap_err();
    assert!(err.is_input_error());
}
