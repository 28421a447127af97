//! Transformer forward pass
//!
//! ```text
//! tokens → embedding (+ learned positions)
//!        → N × [ norm → attention (RoPE, KV cache) → +residual
//!                norm → feed-forward              → +residual ]
//!        → final norm → output head → logits
//! ```
//!
//! Two execution modes share one code path. A full block (`forward`) runs
//! `T` tokens from position 0 with the causal mask fixed over the block. The
//! cached path (`forward_cached`) runs `1..T` new tokens at positions
//! `cache.len()..`, appending their keys and values and attending over
//! everything cached. RoPE angles and learned positions are indexed by
//! absolute position, so both paths produce the same logits for the same
//! positions.
//!
//! Every intermediate buffer is rented from the [`BufferPool`]; a warm
//! decode step performs no heap allocation of its own.

use std::sync::Arc;

use tracing::trace;

use super::config::{FfnKind, NormKind, PositionKind};
use super::rope::RopeTable;
use super::weights::{ModelWeights, Weight};
use crate::attention::{causal_attention, KvCache};
use crate::error::{InferirError, Result};
use crate::kernels::{
    add_assign, add_bias, gelu_in_place, layer_norm, mul_assign, rms_norm, silu_in_place,
    DEFAULT_PARALLEL_THRESHOLD,
};
use crate::pool::{BufferPool, PooledBuffer};
use crate::tensor::Tensor;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full blocks only, no cache
    Training,
    /// Incremental decoding against a [`KvCache`]
    Inference,
}

/// A model ready to run: shared weights, shared pool, precomputed RoPE table
///
/// Cloning is cheap (reference counts only), so each session clones the
/// engine's transformer and owns its own mode flag.
#[derive(Debug, Clone)]
pub struct Transformer {
    weights: Arc<ModelWeights>,
    pool: Arc<BufferPool>,
    rope: Option<Arc<RopeTable>>,
    mode: Mode,
    parallel_threshold: usize,
}

/// Where a block of tokens gets its keys and values from
enum KvSource<'c> {
    /// Keys and values of the block itself
    Block,
    /// Append to and attend over a cache
    Cache(&'c mut KvCache),
}

impl Transformer {
    /// Wrap weights for execution, starting in [`Mode::Inference`]
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the configuration is inconsistent
    pub fn new(weights: Arc<ModelWeights>, pool: Arc<BufferPool>) -> Result<Self> {
        let config = &weights.config;
        config.validate()?;
        let rope = match config.position {
            PositionKind::Rope => Some(Arc::new(RopeTable::new(
                config.head_dim(),
                config.context_length,
                config.rope_theta,
            )?)),
            PositionKind::Learned => None,
        };
        Ok(Self {
            weights,
            pool,
            rope,
            mode: Mode::Inference,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        })
    }

    /// Set the multiply-add count above which matmuls fan out on rayon
    #[must_use]
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Shared weights
    #[must_use]
    pub fn weights(&self) -> &Arc<ModelWeights> {
        &self.weights
    }

    /// Shared scratch pool
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch to incremental decoding; idempotent
    pub fn enable_kv_cache(&mut self) {
        self.mode = Mode::Inference;
    }

    /// Alias of [`Transformer::enable_kv_cache`]
    pub fn eval(&mut self) {
        self.enable_kv_cache();
    }

    /// Switch to full-block mode; idempotent
    pub fn train(&mut self) {
        self.mode = Mode::Training;
    }

    /// Allocate a cache from the pool for up to `max_seq_len` positions
    /// (capped at the context length)
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `max_seq_len` is zero
    pub fn new_cache(&self, max_seq_len: usize) -> Result<KvCache> {
        let c = &self.weights.config;
        KvCache::from_pool(
            &self.pool,
            c.num_layers,
            c.kv_dim(),
            max_seq_len.min(c.context_length),
        )
    }

    /// Return a cache's arenas to the pool
    pub fn release_cache(&self, cache: KvCache) {
        cache.release_into(&self.pool);
    }

    /// Full-block forward pass from position 0
    ///
    /// Returns logits `[T, vocab]`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty block, a block longer than the
    /// context, or an out-of-vocabulary token
    pub fn forward(&self, tokens: &[u32]) -> Result<Tensor> {
        let vocab = self.weights.config.vocab_size;
        let mut logits = vec![0.0; tokens.len() * vocab];
        self.run(tokens, KvSource::Block, true, &mut logits)?;
        Tensor::from_vec(vec![tokens.len(), vocab], logits)
    }

    /// Incremental forward pass; returns logits for the last new token
    ///
    /// # Errors
    ///
    /// - `Validation` outside [`Mode::Inference`], for an empty block or an
    ///   out-of-vocabulary token
    /// - `ShapeMismatch` if the cache was built for another model
    /// - `Capacity` if the cache cannot hold the new positions; the cache is
    ///   left untouched
    pub fn forward_cached(&self, tokens: &[u32], cache: &mut KvCache) -> Result<PooledBuffer<'_>> {
        if self.mode != Mode::Inference {
            return Err(InferirError::validation(
                "forward_cached requires inference mode (call enable_kv_cache)",
            ));
        }
        let mut logits = self.pool.rent(self.weights.config.vocab_size);
        self.run(tokens, KvSource::Cache(cache), false, &mut logits)?;
        Ok(logits)
    }

    fn project(&self, w: &Weight, bias: Option<&Tensor>, x: &[f32], out: &mut [f32]) -> Result<()> {
        w.matmul_t(x, out, &self.pool, self.parallel_threshold)?;
        if let Some(b) = bias {
            add_bias(out, b.data());
        }
        Ok(())
    }

    fn norm(&self, x: &[f32], weight: &Tensor, bias: Option<&Tensor>, out: &mut [f32]) -> Result<()> {
        let eps = self.weights.config.eps;
        match self.weights.config.norm {
            NormKind::LayerNorm => layer_norm(x, weight.data(), bias.map(Tensor::data), eps, out),
            NormKind::RmsNorm => rms_norm(x, weight.data(), eps, out),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run(
        &self,
        tokens: &[u32],
        mut kv: KvSource<'_>,
        all_logits: bool,
        logits: &mut [f32],
    ) -> Result<()> {
        let w = &*self.weights;
        let c = &w.config;
        let t = tokens.len();
        if t == 0 {
            return Err(InferirError::validation("Forward pass needs at least one token"));
        }
        if let Some(&bad) = tokens.iter().find(|&&id| id as usize >= c.vocab_size) {
            return Err(InferirError::validation(format!(
                "Token {bad} outside vocabulary of {}",
                c.vocab_size
            )));
        }

        let start = match &kv {
            KvSource::Block => {
                if t > c.context_length {
                    return Err(InferirError::validation(format!(
                        "Block of {t} tokens exceeds context length {}",
                        c.context_length
                    )));
                }
                0
            },
            KvSource::Cache(cache) => {
                if cache.num_layers() != c.num_layers || cache.kv_dim() != c.kv_dim() {
                    return Err(InferirError::shape(format!(
                        "Cache of {} layers x {} does not fit model of {} layers x {}",
                        cache.num_layers(),
                        cache.kv_dim(),
                        c.num_layers,
                        c.kv_dim()
                    )));
                }
                if !cache.is_consistent() {
                    return Err(InferirError::shape("Cache layers hold different lengths"));
                }
                let requested = cache.len() + t;
                if requested > cache.max_seq_len() {
                    return Err(InferirError::Capacity {
                        layer: 0,
                        capacity: cache.max_seq_len(),
                        requested,
                    });
                }
                cache.len()
            },
        };
        let total = start + t;
        trace!(start, new_tokens = t, "Forward pass");

        let (h, kvd, inter) = (c.hidden_dim, c.kv_dim(), c.intermediate_dim);
        let shape = c.attention_shape();
        let pool = &*self.pool;

        let mut hidden = pool.rent(t * h);
        for (row, &id) in hidden.chunks_exact_mut(h).zip(tokens) {
            w.token_embd.row_into(id as usize, row)?;
        }
        if let Some(pos) = &w.position_embd {
            for (r, row) in hidden.chunks_exact_mut(h).enumerate() {
                add_assign(row, pos.row(start + r)?);
            }
        }

        let mut normed = pool.rent(t * h);
        let mut q = pool.rent(t * h);
        let mut k = pool.rent(t * kvd);
        let mut v = pool.rent(t * kvd);
        let mut attn = pool.rent(t * h);
        let mut proj = pool.rent(t * h);
        let mut up = pool.rent(t * inter);
        let mut gate = pool.rent(if c.ffn == FfnKind::SwiGlu { t * inter } else { 0 });
        let mut scores = pool.rent(t * total);

        for (li, layer) in w.layers.iter().enumerate() {
            self.norm(&hidden, &layer.attn_norm, layer.attn_norm_bias.as_ref(), &mut normed)?;
            self.project(&layer.attn_q, layer.attn_q_bias.as_ref(), &normed, &mut q)?;
            self.project(&layer.attn_k, layer.attn_k_bias.as_ref(), &normed, &mut k)?;
            self.project(&layer.attn_v, layer.attn_v_bias.as_ref(), &normed, &mut v)?;
            if let Some(rope) = &self.rope {
                rope.apply(&mut q, h, start)?;
                rope.apply(&mut k, kvd, start)?;
            }

            match &mut kv {
                KvSource::Block => {
                    causal_attention(&q, &k, &v, shape, &mut scores, &mut attn, self.parallel_threshold)?;
                },
                KvSource::Cache(cache) => {
                    cache.append(li, &k, &v)?;
                    causal_attention(
                        &q,
                        cache.keys(li),
                        cache.values(li),
                        shape,
                        &mut scores,
                        &mut attn,
                        self.parallel_threshold,
                    )?;
                },
            }

            self.project(&layer.attn_output, layer.attn_output_bias.as_ref(), &attn, &mut proj)?;
            add_assign(&mut hidden, &proj);

            self.norm(&hidden, &layer.ffn_norm, layer.ffn_norm_bias.as_ref(), &mut normed)?;
            self.project(&layer.ffn_up, layer.ffn_up_bias.as_ref(), &normed, &mut up)?;
            match (&c.ffn, &layer.ffn_gate) {
                (FfnKind::SwiGlu, Some(g)) => {
                    self.project(g, None, &normed, &mut gate)?;
                    silu_in_place(&mut gate);
                    mul_assign(&mut up, &gate);
                },
                (FfnKind::Gelu, _) => gelu_in_place(&mut up),
                (FfnKind::SwiGlu, None) => {
                    return Err(InferirError::shape(format!("Layer {li} has no gate projection")));
                },
            }
            self.project(&layer.ffn_down, layer.ffn_down_bias.as_ref(), &up, &mut proj)?;
            add_assign(&mut hidden, &proj);
        }

        let rows = if all_logits { t } else { 1 };
        let tail = &hidden[(t - rows) * h..];
        let final_normed = &mut normed[..rows * h];
        self.norm(tail, &w.output_norm, w.output_norm_bias.as_ref(), final_normed)?;
        w.output_head()
            .matmul_t(final_normed, logits, pool, self.parallel_threshold)
    }
}
