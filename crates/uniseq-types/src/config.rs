//! Configuration types for long-context attention layers

use crate::{AttnType, Result, RingImplType, UniseqError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a forward call is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Pipelined when the head count divides into chunks, sequential otherwise
    Auto,
    /// Always pipelined; an indivisible head count is a configuration error
    Pipelined,
    /// Always the sequential exchange -> attend -> exchange path
    Sequential,
}

impl Default for ForwardMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Long-context attention layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongContextAttentionConfig {
    /// Scatter axis of the sequence-to-head exchange
    pub scatter_idx: usize,
    /// Gather axis of the sequence-to-head exchange
    pub gather_idx: usize,
    /// Ring layout name, resolved to [`RingImplType`] at construction
    pub ring_impl_type: String,
    /// Exchange query, key and value as one packed tensor
    pub use_pack_qkv: bool,
    /// Thread the caller's persistent KV cache through the ring step
    pub use_kv_cache: bool,
    /// Kernel variant requested from the attention kernel
    pub attn_type: AttnType,
    /// Pipelined or sequential execution
    pub forward_mode: ForwardMode,
    /// Make the input lane wait on the compute lane before the first exchange
    pub prime_output_slots: bool,
}

impl Default for LongContextAttentionConfig {
    fn default() -> Self {
        Self {
            scatter_idx: 2,
            gather_idx: 1,
            ring_impl_type: RingImplType::Basic.to_string(),
            use_pack_qkv: false,
            use_kv_cache: false,
            attn_type: AttnType::default(),
            forward_mode: ForwardMode::default(),
            prime_output_slots: true,
        }
    }
}

impl LongContextAttentionConfig {
    /// Parse configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Set the ring layout name
    pub fn with_ring_impl_type(mut self, name: impl Into<String>) -> Self {
        self.ring_impl_type = name.into();
        self
    }

    /// Enable or disable the persistent KV cache
    pub fn with_kv_cache(mut self, enabled: bool) -> Self {
        self.use_kv_cache = enabled;
        self
    }

    /// Enable or disable packed q/k/v exchange
    pub fn with_pack_qkv(mut self, enabled: bool) -> Self {
        self.use_pack_qkv = enabled;
        self
    }

    /// Set the forward mode
    pub fn with_forward_mode(mut self, mode: ForwardMode) -> Self {
        self.forward_mode = mode;
        self
    }

    /// Set the kernel variant
    pub fn with_attn_type(mut self, attn_type: AttnType) -> Self {
        self.attn_type = attn_type;
        self
    }

    /// Resolve the ring layout name
    pub fn ring_impl(&self) -> Result<RingImplType> {
        self.ring_impl_type.parse()
    }

    /// Validate the combination of settings
    pub fn validate(&self) -> Result<()> {
        if self.scatter_idx > 3 || self.gather_idx > 3 {
            return Err(UniseqError::config(format!(
                "scatter_idx ({}) and gather_idx ({}) must address a 4-D tensor",
                self.scatter_idx, self.gather_idx
            )));
        }
        if self.scatter_idx == self.gather_idx {
            return Err(UniseqError::config(format!(
                "scatter_idx and gather_idx must differ, both are {}",
                self.scatter_idx
            )));
        }
        let ring_impl = self.ring_impl()?;
        if self.use_kv_cache && !ring_impl.supports_kv_cache() {
            return Err(UniseqError::config(format!(
                "ring_impl_type: {} do not support SP kv cache.",
                self.ring_impl_type
            )));
        }
        Ok(())
    }
}
