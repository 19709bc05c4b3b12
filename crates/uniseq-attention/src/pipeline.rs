//! Double-buffered pipeline driver
//!
//! Splits the heads into chunks of one head per ulysses rank and overlaps
//! three lanes:
//!
//! ```text
//! input-comm   | xchg 0 | xchg 1 | xchg 2 | ...
//! compute               | ring 0 | ring 1 | ring 2 | ...
//! output-comm                    | inv 0  | inv 1  | inv 2 | ...
//! ```
//!
//! Every hand-off goes through a buffer slot guarded by the producer's
//! completion token. Results are gathered by chunk index, so the final
//! concatenation order never depends on completion timing.

use crate::joint::JointInputs;
use crate::kv_cache::{AttentionModule, KvCache, SharedKvCache};
use crate::layer::{split_packed, LongContextAttention};
use crate::params::{AttentionParams, Descale};
use crate::ring::{RingAttention, RingInputs};
use candle_core::Tensor;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use uniseq_comm::{HeadExchange, HeadRange};
use uniseq_runtime::{BufferAudit, BufferPool, LaneSet};
use uniseq_types::{JointStrategy, LaneKind, Result, UniseqError};

/// What a pipelined forward call did with its slots
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Head chunks (NUM_BUFFERS)
    pub num_chunks: usize,
    /// Whether chunks were exchanged as one packed tensor
    pub packed: bool,
    /// Slot hand-off violations observed during the call
    pub audit: Arc<BufferAudit>,
}

/// One head chunk before or after the input exchange
enum ChunkPayload {
    Packed(Tensor),
    Split {
        query: Tensor,
        key: Tensor,
        value: Tensor,
    },
}

impl ChunkPayload {
    fn exchange(self, exchange: &HeadExchange, channel: LaneKind) -> Result<Self> {
        match self {
            ChunkPayload::Packed(qkv) => Ok(ChunkPayload::Packed(exchange.forward(&qkv, channel)?)),
            ChunkPayload::Split { query, key, value } => Ok(ChunkPayload::Split {
                query: exchange.forward(&query, channel)?,
                key: exchange.forward(&key, channel)?,
                value: exchange.forward(&value, channel)?,
            }),
        }
    }

    fn into_qkv(self) -> Result<(Tensor, Tensor, Tensor)> {
        match self {
            ChunkPayload::Packed(qkv) => split_packed(&qkv),
            ChunkPayload::Split { query, key, value } => Ok((query, key, value)),
        }
    }
}

/// Per-chunk state moved into a compute-lane task
struct ChunkAttention {
    ring: RingAttention,
    params: AttentionParams,
    descale: Descale,
    cache: Option<SharedKvCache>,
    joint_kv: Option<(Tensor, Tensor)>,
    joint_strategy: JointStrategy,
    alibi: Option<Tensor>,
    slot: usize,
}

impl ChunkAttention {
    fn run(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let mut guard = self.cache.as_ref().map(|cache| cache.lock());
        self.ring.run(
            RingInputs {
                query,
                key,
                value,
                joint_key: self.joint_kv.as_ref().map(|(k, _)| k),
                joint_value: self.joint_kv.as_ref().map(|(_, v)| v),
                joint_strategy: self.joint_strategy,
                alibi_slopes: self.alibi.as_ref(),
                cache_slot: self.slot,
            },
            &self.params,
            guard.as_deref_mut().map(|cache| cache as &mut dyn KvCache),
            &self.descale,
        )
    }
}

pub(crate) struct PipelineDriver<'a> {
    layer: &'a LongContextAttention,
    lanes: &'a LaneSet,
}

impl<'a> PipelineDriver<'a> {
    pub(crate) fn new(layer: &'a LongContextAttention, lanes: &'a LaneSet) -> Self {
        Self { layer, lanes }
    }

    pub(crate) fn run(
        self,
        module: &AttentionModule,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, PipelineReport)> {
        let num_heads = query.dim(2)?;
        let num_chunks = self.layer.num_chunks(num_heads)?;
        let joint = JointInputs::from_params(params)?;
        let query = match &joint {
            Some(joint) => joint.concat_query(query)?,
            None => query.clone(),
        };
        let packed = self.layer.config.use_pack_qkv && query.dims() == key.dims();
        let audit = BufferAudit::new();
        debug!(
            "Pipelined forward: {} heads in {} chunks (packed: {})",
            num_heads, num_chunks, packed
        );

        let results = Arc::new(Mutex::new(vec![None; num_chunks]));
        let issued = self.issue(
            module,
            &query,
            key,
            value,
            params,
            joint.as_ref(),
            num_chunks,
            packed,
            &audit,
            &results,
        );
        // Every lane must drain, even when issuing failed half way.
        let synced = self.lanes.synchronize_all();
        issued?;
        synced?;

        let outputs = results
            .lock()
            .iter()
            .enumerate()
            .map(|(chunk, output)| {
                output.clone().ok_or_else(|| {
                    UniseqError::internal(format!("chunk {} produced no output", chunk))
                })
            })
            .collect::<Result<Vec<Tensor>>>()?;
        if !audit.is_clean() {
            warn!(
                "Pipeline slot violations: {} early reads, {} overwrites, {} missing",
                audit.early_reads(),
                audit.overwrites(),
                audit.missing()
            );
        }
        let output = Tensor::cat(&outputs, 2)?;
        Ok((
            output,
            PipelineReport {
                num_chunks,
                packed,
                audit,
            },
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn issue(
        &self,
        module: &AttentionModule,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        params: &AttentionParams,
        joint: Option<&JointInputs>,
        num_chunks: usize,
        packed: bool,
        audit: &Arc<BufferAudit>,
        results: &Arc<Mutex<Vec<Option<Tensor>>>>,
    ) -> Result<()> {
        let layer = self.layer;
        let lanes = self.lanes;
        let chunk_heads = layer.groups.ulysses_size();
        let ulysses_rank = layer.groups.ulysses.rank();

        let mut inputs: BufferPool<ChunkPayload> =
            BufferPool::new("input", num_chunks, Arc::clone(audit));
        let mut outputs: BufferPool<Tensor> =
            BufferPool::new("output", num_chunks, Arc::clone(audit));

        if layer.config.prime_output_slots {
            // Input exchanges start only after the compute lane's prior work.
            for _ in 0..num_chunks {
                let token = lanes.compute().record()?;
                lanes.input().wait(&token)?;
            }
        }

        let qkv = if packed {
            Some(Tensor::cat(&[query, key, value], 0)?.contiguous()?)
        } else {
            None
        };
        let head_chunk = |tensor: &Tensor, chunk: usize| -> Result<Tensor> {
            Ok(tensor.narrow(2, chunk * chunk_heads, chunk_heads)?.contiguous()?)
        };

        for chunk in 0..num_chunks {
            let payload = match &qkv {
                Some(qkv) => ChunkPayload::Packed(head_chunk(qkv, chunk)?),
                None => ChunkPayload::Split {
                    query: head_chunk(query, chunk)?,
                    key: head_chunk(key, chunk)?,
                    value: head_chunk(value, chunk)?,
                },
            };
            let writer = inputs.writer(chunk)?;
            let exchange = layer.exchange.clone();
            lanes.input().enqueue("head exchange", move || {
                writer.put(payload.exchange(&exchange, LaneKind::InputComm)?);
                Ok(())
            })?;
            let token = lanes.input().record()?;
            inputs.publish(chunk, token)?;
        }

        let cache = layer.cache_for(module);
        let mut processed = 0;
        while processed < num_chunks {
            let mut progressed = false;

            for chunk in 0..num_chunks {
                if !inputs.in_use(chunk) {
                    continue;
                }
                let reader = inputs.reader(chunk)?;
                lanes.compute().wait(reader.token())?;

                let range = HeadRange::for_chunk(chunk, chunk_heads, chunk_heads, ulysses_rank)?;
                let attention = ChunkAttention {
                    ring: layer.ring.clone(),
                    params: params.clone(),
                    descale: layer.descale.clone(),
                    cache: cache.clone(),
                    joint_kv: joint.map(|j| j.slice_heads(range)).transpose()?,
                    joint_strategy: joint.map(|j| j.strategy()).unwrap_or_default(),
                    alibi: params
                        .alibi_slopes
                        .as_ref()
                        .map(|slopes| range.slice(slopes, 0))
                        .transpose()?,
                    slot: chunk,
                };
                let writer = outputs.writer(chunk)?;
                lanes.compute().enqueue("ring attention", move || {
                    let (q, k, v) = reader.take()?.into_qkv()?;
                    writer.put(attention.run(&q, &k, &v)?);
                    Ok(())
                })?;
                let token = lanes.compute().record()?;
                outputs.publish(chunk, token)?;
                inputs.release(chunk)?;
                progressed = true;
            }

            for chunk in 0..num_chunks {
                if !outputs.in_use(chunk) {
                    continue;
                }
                let reader = outputs.reader(chunk)?;
                lanes.output().wait(reader.token())?;
                let exchange = layer.exchange.clone();
                let results = Arc::clone(results);
                lanes.output().enqueue("inverse head exchange", move || {
                    let context = reader.take()?;
                    let output = exchange.inverse(&context, LaneKind::OutputComm)?;
                    results.lock()[chunk] = Some(output);
                    Ok(())
                })?;
                outputs.release(chunk)?;
                processed += 1;
                progressed = true;
            }

            if !progressed {
                return Err(UniseqError::internal(format!(
                    "pipeline stalled with {}/{} chunks processed",
                    processed, num_chunks
                )));
            }
        }
        Ok(())
    }
}
