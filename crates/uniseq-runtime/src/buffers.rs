//! Multi-buffered chunk slots handed between lanes
//!
//! A slot is written by a task on the producer lane, published with the
//! producer's completion token, read by a task on the consumer lane after
//! that lane waited on the token, and finally released by the issuer. The
//! `in_use` flag is issuer-side bookkeeping; the data cell is touched only
//! from lane tasks.

use crate::token::CompletionToken;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;
use uniseq_types::{Result, UniseqError};

/// Hand-off violation counters shared by the pools of one forward call
#[derive(Debug, Default)]
pub struct BufferAudit {
    early_reads: AtomicUsize,
    overwrites: AtomicUsize,
    missing: AtomicUsize,
}

impl BufferAudit {
    /// Create a fresh shared audit
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reads that happened before the producer's token was satisfied
    pub fn early_reads(&self) -> usize {
        self.early_reads.load(Ordering::Relaxed)
    }

    /// Writes into a slot that was still in use or still held data
    pub fn overwrites(&self) -> usize {
        self.overwrites.load(Ordering::Relaxed)
    }

    /// Reads that found the slot empty
    pub fn missing(&self) -> usize {
        self.missing.load(Ordering::Relaxed)
    }

    /// Total violations of any kind
    pub fn violations(&self) -> usize {
        self.early_reads() + self.overwrites() + self.missing()
    }

    /// Whether no violation was observed
    pub fn is_clean(&self) -> bool {
        self.violations() == 0
    }
}

struct BufferSlot<T> {
    cell: Arc<Mutex<Option<T>>>,
    token: Option<CompletionToken>,
    in_use: bool,
}

/// Fixed-size pool of chunk slots
pub struct BufferPool<T> {
    name: &'static str,
    slots: Vec<BufferSlot<T>>,
    audit: Arc<BufferAudit>,
}

impl<T: Send + 'static> BufferPool<T> {
    /// Create a pool of `len` empty slots
    pub fn new(name: &'static str, len: usize, audit: Arc<BufferAudit>) -> Self {
        let slots = (0..len)
            .map(|_| BufferSlot {
                cell: Arc::new(Mutex::new(None)),
                token: None,
                in_use: false,
            })
            .collect();
        Self { name, slots, audit }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether slot `index` holds unconsumed data
    pub fn in_use(&self, index: usize) -> bool {
        self.slots.get(index).map(|s| s.in_use).unwrap_or(false)
    }

    /// Token published with slot `index`, if any
    pub fn token(&self, index: usize) -> Option<&CompletionToken> {
        self.slots.get(index).and_then(|s| s.token.as_ref())
    }

    fn slot(&self, index: usize) -> Result<&BufferSlot<T>> {
        self.slots.get(index).ok_or_else(|| {
            UniseqError::runtime(format!(
                "{} pool has {} slots, index {} out of range",
                self.name,
                self.slots.len(),
                index
            ))
        })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut BufferSlot<T>> {
        let (name, len) = (self.name, self.slots.len());
        self.slots.get_mut(index).ok_or_else(|| {
            UniseqError::runtime(format!(
                "{} pool has {} slots, index {} out of range",
                name, len, index
            ))
        })
    }

    /// Claim slot `index` for writing
    ///
    /// Fails while the slot is still in use.
    pub fn writer(&self, index: usize) -> Result<SlotWriter<T>> {
        let slot = self.slot(index)?;
        if slot.in_use {
            self.audit.overwrites.fetch_add(1, Ordering::Relaxed);
            warn!("{} slot {} claimed while in use", self.name, index);
            return Err(UniseqError::runtime(format!(
                "{} slot {} is still in use",
                self.name, index
            )));
        }
        Ok(SlotWriter {
            index,
            cell: Arc::clone(&slot.cell),
            audit: Arc::clone(&self.audit),
        })
    }

    /// Mark slot `index` in use, guarded by the producer's `token`
    pub fn publish(&mut self, index: usize, token: CompletionToken) -> Result<()> {
        let slot = self.slot_mut(index)?;
        slot.token = Some(token);
        slot.in_use = true;
        Ok(())
    }

    /// Hand out a reader for slot `index`
    pub fn reader(&self, index: usize) -> Result<SlotReader<T>> {
        let slot = self.slot(index)?;
        let token = slot.token.clone().ok_or_else(|| {
            UniseqError::runtime(format!("{} slot {} was never published", self.name, index))
        })?;
        Ok(SlotReader {
            index,
            cell: Arc::clone(&slot.cell),
            token,
            audit: Arc::clone(&self.audit),
        })
    }

    /// Clear the in-use flag of slot `index`
    pub fn release(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        slot.in_use = false;
        Ok(())
    }
}

/// Write handle moved into a producer-lane task
pub struct SlotWriter<T> {
    index: usize,
    cell: Arc<Mutex<Option<T>>>,
    audit: Arc<BufferAudit>,
}

impl<T> SlotWriter<T> {
    /// Slot index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Store the chunk
    pub fn put(self, value: T) {
        let mut cell = self.cell.lock();
        if cell.is_some() {
            self.audit.overwrites.fetch_add(1, Ordering::Relaxed);
        }
        *cell = Some(value);
    }
}

/// Read handle moved into a consumer-lane task
pub struct SlotReader<T> {
    index: usize,
    cell: Arc<Mutex<Option<T>>>,
    token: CompletionToken,
    audit: Arc<BufferAudit>,
}

impl<T> SlotReader<T> {
    /// Slot index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Producer token the consumer lane must wait on before reading
    pub fn token(&self) -> &CompletionToken {
        &self.token
    }

    /// Take the chunk out of the slot
    pub fn take(self) -> Result<T> {
        if !self.token.is_ready() {
            self.audit.early_reads.fetch_add(1, Ordering::Relaxed);
        }
        self.cell.lock().take().ok_or_else(|| {
            self.audit.missing.fetch_add(1, Ordering::Relaxed);
            UniseqError::runtime(format!("slot {} read while empty", self.index))
        })
    }
}
