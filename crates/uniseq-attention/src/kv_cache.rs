//! Persistent per-rank key/value cache
//!
//! The cache belongs to the caller's attention module and outlives forward
//! calls. The ring step hands it the fresh head-sharded key/value of a chunk
//! and attends over whatever the cache returns.

use candle_core::Tensor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uniseq_types::{Result, UniseqError};

/// Key/value cache threaded through the ring step
pub trait KvCache: Send {
    /// Store the fresh `key`/`value` of `slot` and return what to attend over
    ///
    /// `slot` separates the head subsets of the pipelined path, one per chunk.
    fn update_and_get(&mut self, slot: usize, key: &Tensor, value: &Tensor)
        -> Result<(Tensor, Tensor)>;

    /// Drop all cached state
    fn clear(&mut self);
}

/// Cache shared between the caller's module and lane tasks
pub type SharedKvCache = Arc<Mutex<dyn KvCache>>;

/// Displaced-patch cache
///
/// The sequence is split into patches computed in turn. The caller selects
/// the current patch, its key/value replaces the cached one, and the ring
/// step attends over all cached patches in patch order.
pub struct PatchKvCache {
    num_patches: usize,
    current: usize,
    /// Sequence axis of cached tensors
    seq_dim: usize,
    slots: HashMap<usize, Vec<Option<(Tensor, Tensor)>>>,
}

impl PatchKvCache {
    pub fn new(num_patches: usize) -> Result<Self> {
        if num_patches == 0 {
            return Err(UniseqError::config("patch cache needs at least one patch"));
        }
        Ok(Self {
            num_patches,
            current: 0,
            seq_dim: 1,
            slots: HashMap::new(),
        })
    }

    /// Wrap into a handle for an [`AttentionModule`]
    pub fn shared(self) -> SharedKvCache {
        Arc::new(Mutex::new(self))
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub fn current_patch(&self) -> usize {
        self.current
    }

    /// Select the patch the next update belongs to
    pub fn set_patch(&mut self, patch: usize) -> Result<()> {
        if patch >= self.num_patches {
            return Err(UniseqError::input_validation(format!(
                "patch {} out of range, cache holds {} patches",
                patch, self.num_patches
            )));
        }
        self.current = patch;
        Ok(())
    }

    /// Number of slots holding cached state
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Cached patches of `slot`
    pub fn cached_patches(&self, slot: usize) -> usize {
        self.slots
            .get(&slot)
            .map(|patches| patches.iter().filter(|p| p.is_some()).count())
            .unwrap_or(0)
    }
}

impl KvCache for PatchKvCache {
    fn update_and_get(
        &mut self,
        slot: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (num_patches, current, seq_dim) = (self.num_patches, self.current, self.seq_dim);
        let patches = self
            .slots
            .entry(slot)
            .or_insert_with(|| vec![None; num_patches]);
        patches[current] = Some((key.clone(), value.clone()));

        let (keys, values): (Vec<&Tensor>, Vec<&Tensor>) = patches
            .iter()
            .flatten()
            .map(|(k, v)| (k, v))
            .unzip();
        Ok((
            Tensor::cat(&keys, seq_dim)?,
            Tensor::cat(&values, seq_dim)?,
        ))
    }

    fn clear(&mut self) {
        debug!("Clearing patch cache ({} slots)", self.slots.len());
        self.slots.clear();
        self.current = 0;
    }
}

impl fmt::Debug for PatchKvCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchKvCache")
            .field("num_patches", &self.num_patches)
            .field("current", &self.current)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Caller-owned attention module handle
///
/// Forward calls only borrow it; the cache it carries persists across calls.
#[derive(Clone)]
pub struct AttentionModule {
    name: String,
    kv_cache: Option<SharedKvCache>,
}

impl AttentionModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kv_cache: None,
        }
    }

    pub fn with_kv_cache(mut self, cache: SharedKvCache) -> Self {
        self.kv_cache = Some(cache);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kv_cache(&self) -> Option<&SharedKvCache> {
        self.kv_cache.as_ref()
    }
}

impl fmt::Debug for AttentionModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttentionModule")
            .field("name", &self.name)
            .field("kv_cache", &self.kv_cache.is_some())
            .finish()
    }
}
