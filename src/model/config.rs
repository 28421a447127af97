//! Model hyperparameters
//!
//! [`ModelConfig`] is extracted from container metadata plus tensor presence
//! (a gate projection means SwiGLU, a norm bias means LayerNorm, a learned
//! position table means no RoPE). It is also the hyperparameter block of a
//! checkpoint, so it round-trips through JSON.

use serde::{Deserialize, Serialize};

use crate::attention::AttentionShape;
use crate::error::{InferirError, Result};
use crate::gguf::{GgufFile, GgufWriter, MetadataValue};

/// Default RoPE frequency base when the container names none
pub const DEFAULT_ROPE_THETA: f32 = 10_000.0;

/// Default normalization epsilon
pub const DEFAULT_EPS: f32 = 1e-5;

/// Default context length when the container names none
pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;

/// Normalization applied before attention, before the FFN and before the
/// output head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// Mean/variance normalization with weight and bias (GPT-2 family)
    LayerNorm,
    /// Root-mean-square normalization, weight only (LLaMA family)
    RmsNorm,
}

/// Feed-forward block structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FfnKind {
    /// `down(gelu(up(x)))`
    Gelu,
    /// `down(silu(gate(x)) * up(x))`
    SwiGlu,
}

/// How positions are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionKind {
    /// Rotary embedding on Q and K (adjacent-pair rotation)
    Rope,
    /// Learned absolute embeddings added to the token embedding
    Learned,
}

/// Transformer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture name (`general.architecture`)
    pub architecture: String,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Embedding dimension
    pub hidden_dim: usize,
    /// Number of transformer blocks
    pub num_layers: usize,
    /// Query heads
    pub num_heads: usize,
    /// Key/value heads (grouped-query attention when fewer than `num_heads`)
    pub num_kv_heads: usize,
    /// FFN inner dimension
    pub intermediate_dim: usize,
    /// Maximum positions
    pub context_length: usize,
    /// RoPE frequency base
    pub rope_theta: f32,
    /// Normalization epsilon
    pub eps: f32,
    /// Normalization kind
    pub norm: NormKind,
    /// Feed-forward kind
    pub ffn: FfnKind,
    /// Position encoding
    pub position: PositionKind,
    /// Q/K/V/output projections carry biases
    pub attention_bias: bool,
    /// FFN up/down projections carry biases
    pub ffn_bias: bool,
    /// Output head reuses the token embedding
    pub tied_output: bool,
    /// Beginning-of-sequence token
    pub bos_token_id: Option<u32>,
    /// End-of-sequence token
    pub eos_token_id: Option<u32>,
    /// Whether prompts start with BOS
    pub add_bos: bool,
}

impl ModelConfig {
    /// Width of one attention head
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads.max(1)
    }

    /// Width of one packed key or value row
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim()
    }

    /// Head layout for the attention kernel
    #[must_use]
    pub fn attention_shape(&self) -> AttentionShape {
        AttentionShape {
            num_heads: self.num_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim(),
        }
    }

    /// Check structural invariants
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a dimension is zero, heads do not divide the
    /// hidden size, key/value heads do not divide query heads, RoPE is
    /// configured with an odd head width, or a special token is out of range
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("vocab_size", self.vocab_size),
            ("hidden_dim", self.hidden_dim),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("intermediate_dim", self.intermediate_dim),
            ("context_length", self.context_length),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(InferirError::validation(format!("{name} must be > 0")));
        }
        if self.hidden_dim % self.num_heads != 0 {
            return Err(InferirError::validation(format!(
                "hidden_dim ({}) must be divisible by num_heads ({})",
                self.hidden_dim, self.num_heads
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(InferirError::validation(format!(
                "num_heads ({}) must be divisible by num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.position == PositionKind::Rope && self.head_dim() % 2 != 0 {
            return Err(InferirError::validation(format!(
                "RoPE needs an even head_dim, got {}",
                self.head_dim()
            )));
        }
        if self.eps.is_nan() || self.eps <= 0.0 || self.rope_theta.is_nan() || self.rope_theta <= 0.0
        {
            return Err(InferirError::validation(format!(
                "eps ({}) and rope_theta ({}) must be positive",
                self.eps, self.rope_theta
            )));
        }
        for (name, id) in [("bos", self.bos_token_id), ("eos", self.eos_token_id)] {
            if let Some(id) = id {
                if id as usize >= self.vocab_size {
                    return Err(InferirError::validation(format!(
                        "{name} token {id} outside vocabulary of {}",
                        self.vocab_size
                    )));
                }
            }
        }
        Ok(())
    }

    /// Extract hyperparameters from container metadata and tensor directory
    ///
    /// # Errors
    ///
    /// Returns `Format` if the architecture, embedding length, block count or
    /// head count is missing, no vocabulary size can be determined, or the
    /// result fails [`ModelConfig::validate`]
    pub fn from_gguf(file: &GgufFile) -> Result<Self> {
        let architecture = file.architecture()?.to_string();
        let arch_key = |k: &str| format!("{architecture}.{k}");
        let get_usize = |k: &str| file.get(&arch_key(k)).and_then(MetadataValue::as_usize);
        let get_f32 = |k: &str| file.get(&arch_key(k)).and_then(MetadataValue::as_f32);
        let require = |k: &str| {
            get_usize(k).ok_or_else(|| InferirError::format(format!("Missing {}", arch_key(k))))
        };

        let hidden_dim = require("embedding_length")?;
        let num_layers = require("block_count")?;
        let num_heads = require("attention.head_count")?;
        let num_kv_heads = get_usize("attention.head_count_kv").unwrap_or(num_heads);

        let intermediate_dim = get_usize("feed_forward_length")
            .or_else(|| file.tensor("blk.0.ffn_up.weight").map(|t| t.matrix_dims().0))
            .unwrap_or(hidden_dim * 4);
        let context_length = get_usize("context_length").unwrap_or(DEFAULT_CONTEXT_LENGTH);

        let vocab_size = file
            .get("tokenizer.ggml.tokens")
            .and_then(MetadataValue::as_array)
            .map(<[MetadataValue]>::len)
            .or_else(|| get_usize("vocab_size"))
            .or_else(|| file.tensor("token_embd.weight").map(|t| t.matrix_dims().0))
            .ok_or_else(|| InferirError::format("Cannot determine vocabulary size"))?;

        let rms_eps = get_f32("attention.layer_norm_rms_epsilon");
        let ln_eps = get_f32("attention.layer_norm_epsilon");
        let norm = if rms_eps.is_some() {
            NormKind::RmsNorm
        } else if ln_eps.is_some() || file.tensor("blk.0.attn_norm.bias").is_some() {
            NormKind::LayerNorm
        } else {
            NormKind::RmsNorm
        };
        let eps = rms_eps.or(ln_eps).unwrap_or(DEFAULT_EPS);

        let position = if file.tensor("position_embd.weight").is_some() {
            PositionKind::Learned
        } else {
            PositionKind::Rope
        };
        let ffn = if file.tensor("blk.0.ffn_gate.weight").is_some() {
            FfnKind::SwiGlu
        } else {
            FfnKind::Gelu
        };

        let token = |k: &str| file.get(k).and_then(MetadataValue::as_u32);
        let bos_token_id = token("tokenizer.ggml.bos_token_id");
        let eos_token_id = token("tokenizer.ggml.eos_token_id");
        let add_bos = file
            .get("tokenizer.ggml.add_bos_token")
            .and_then(MetadataValue::as_bool)
            .unwrap_or(bos_token_id.is_some());

        let config = Self {
            rope_theta: get_f32("rope.freq_base").unwrap_or(DEFAULT_ROPE_THETA),
            attention_bias: file.tensor("blk.0.attn_q.bias").is_some(),
            ffn_bias: file.tensor("blk.0.ffn_up.bias").is_some(),
            tied_output: file.tensor("output.weight").is_none(),
            architecture,
            vocab_size,
            hidden_dim,
            num_layers,
            num_heads,
            num_kv_heads,
            intermediate_dim,
            context_length,
            eps,
            norm,
            ffn,
            position,
            bos_token_id,
            eos_token_id,
            add_bos,
        };
        config
            .validate()
            .map_err(|e| InferirError::format(format!("Model header: {e}")))?;
        Ok(config)
    }

    /// Write these hyperparameters as container metadata
    ///
    /// Structural variants (norm bias, gate, position table, output head)
    /// are implied by which tensors the caller adds.
    #[must_use]
    pub fn write_metadata(&self, writer: GgufWriter) -> GgufWriter {
        let arch = &self.architecture;
        let key = |k: &str| format!("{arch}.{k}");
        let as_u32 = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        let eps_key = match self.norm {
            NormKind::RmsNorm => "attention.layer_norm_rms_epsilon",
            NormKind::LayerNorm => "attention.layer_norm_epsilon",
        };
        let mut w = writer
            .architecture(arch)
            .add_u32(&key("vocab_size"), as_u32(self.vocab_size))
            .add_u32(&key("embedding_length"), as_u32(self.hidden_dim))
            .add_u32(&key("block_count"), as_u32(self.num_layers))
            .add_u32(&key("attention.head_count"), as_u32(self.num_heads))
            .add_u32(&key("attention.head_count_kv"), as_u32(self.num_kv_heads))
            .add_u32(&key("feed_forward_length"), as_u32(self.intermediate_dim))
            .add_u32(&key("context_length"), as_u32(self.context_length))
            .add_f32(&key(eps_key), self.eps)
            .add_bool("tokenizer.ggml.add_bos_token", self.add_bos);
        if self.position == PositionKind::Rope {
            w = w.add_f32(&key("rope.freq_base"), self.rope_theta);
        }
        if let Some(id) = self.bos_token_id {
            w = w.add_u32("tokenizer.ggml.bos_token_id", id);
        }
        if let Some(id) = self.eos_token_id {
            w = w.add_u32("tokenizer.ggml.eos_token_id", id);
        }
        w
    }
}
