//! Hybrid Ulysses + Ring long-context attention
//!
//! Self-attention over a sequence sharded across many ranks. Heads are
//! re-sharded with an all-to-all inside the ulysses group, key/value blocks
//! circulate inside the ring group, and the forward pass is split into
//! head chunks so the exchange of one chunk overlaps with attention on
//! another.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    LongContextAttention                      │
//! │   forward() ── pipelined ──▶ PipelineDriver (3 lanes)        │
//! │             └─ sequential ─▶ exchange → ring → exchange      │
//! └──────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌────────────────────┐
//! │  HeadExchange   │ │  RingAttention   │ │   KvCache / joint  │
//! │ (uniseq-comm)   │ │ AttentionKernel  │ │     tensors        │
//! └─────────────────┘ └──────────────────┘ └────────────────────┘
//! ```

pub mod joint;
pub mod kernel;
pub mod kv_cache;
pub mod layer;
pub mod linear;
pub mod params;
pub mod pipeline;
pub mod processor;
pub mod reference;
pub mod ring;

pub use joint::JointInputs;
pub use kernel::{AttentionKernel, KernelArgs, KernelOutput};
pub use kv_cache::{AttentionModule, KvCache, PatchKvCache, SharedKvCache};
pub use layer::{LongContextAttention, LongContextAttentionBuilder};
pub use linear::{LinearLongContextAttention, LinearRingKernel, ReluLinearAttention};
pub use params::{AttentionParams, Descale};
pub use pipeline::PipelineReport;
pub use processor::{AttentionProcessor, ScaledDotProductProcessor, TopKSparseProcessor};
pub use reference::ReferenceAttention;
pub use ring::{RingAttention, RingInputs};
