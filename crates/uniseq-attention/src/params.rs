//! Call-time attention hyperparameters

use candle_core::Tensor;

/// Hyperparameters and optional joint tensors of one forward call
#[derive(Debug, Clone)]
pub struct AttentionParams {
    /// Replicated query segment, `(batch, joint_len, heads, head_dim)`
    pub joint_query: Option<Tensor>,
    /// Replicated key segment, all heads
    pub joint_key: Option<Tensor>,
    /// Replicated value segment, all heads
    pub joint_value: Option<Tensor>,
    /// Joint placement name: "front" or "rear"; "none" without joint tensors
    pub joint_strategy: String,
    pub dropout_p: f64,
    /// Defaults to `1/sqrt(head_dim)`
    pub softmax_scale: Option<f64>,
    pub causal: bool,
    /// `(left, right)` window, `-1` for unbounded
    pub window_size: (i64, i64),
    /// One slope per head of the full model
    pub alibi_slopes: Option<Tensor>,
    pub deterministic: bool,
    pub return_attn_probs: bool,
}

impl Default for AttentionParams {
    fn default() -> Self {
        Self {
            joint_query: None,
            joint_key: None,
            joint_value: None,
            joint_strategy: "none".to_string(),
            dropout_p: 0.0,
            softmax_scale: None,
            causal: false,
            window_size: (-1, -1),
            alibi_slopes: None,
            deterministic: false,
            return_attn_probs: false,
        }
    }
}

impl AttentionParams {
    /// Attach joint tensors and their placement
    pub fn with_joint(
        mut self,
        query: Option<Tensor>,
        key: Option<Tensor>,
        value: Option<Tensor>,
        strategy: impl Into<String>,
    ) -> Self {
        self.joint_query = query;
        self.joint_key = key;
        self.joint_value = value;
        self.joint_strategy = strategy.into();
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_softmax_scale(mut self, scale: f64) -> Self {
        self.softmax_scale = Some(scale);
        self
    }

    pub fn with_window(mut self, left: i64, right: i64) -> Self {
        self.window_size = (left, right);
        self
    }

    pub fn with_alibi_slopes(mut self, slopes: Tensor) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    pub fn with_dropout(mut self, dropout_p: f64) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_return_attn_probs(mut self, enabled: bool) -> Self {
        self.return_attn_probs = enabled;
        self
    }
}

/// Scale corrections for reduced-precision query/key/value
///
/// Passed to the kernel untouched.
#[derive(Debug, Clone, Default)]
pub struct Descale {
    pub q: Option<Tensor>,
    pub k: Option<Tensor>,
    pub v: Option<Tensor>,
}

impl Descale {
    /// Create descale factors
    pub fn new(q: Option<Tensor>, k: Option<Tensor>, v: Option<Tensor>) -> Self {
        Self { q, k, v }
    }

    /// Whether any factor is set
    pub fn is_set(&self) -> bool {
        self.q.is_some() || self.k.is_some() || self.v.is_some()
    }
}
