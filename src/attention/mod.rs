//! Causal multi-head attention with incremental KV caching
//!
//! Queries for `T` new positions attend to `L` key/value rows, where the last
//! `T` of those rows belong to the new positions themselves. Row `t` of the
//! queries sits at absolute position `L - T + t` and may attend to columns
//! `[0, L - T + t]`. A full block without a cache is the special case
//! `L == T`.
//!
//! Grouped-query attention maps query head `h` onto key/value head
//! `h / (num_heads / num_kv_heads)`.

mod kv_cache;

pub use kv_cache::{CacheState, KvCache};

use crate::error::{InferirError, Result};
use crate::kernels::{
    fused_scale_mask_softmax, matmul_into_with, matmul_transpose_b_into_with, MatView, MatViewMut,
};

/// Head layout of one attention layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    /// Query heads
    pub num_heads: usize,
    /// Key/value heads (divides `num_heads`)
    pub num_kv_heads: usize,
    /// Width of one head
    pub head_dim: usize,
}

impl AttentionShape {
    /// Width of the packed query projection
    #[must_use]
    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Width of one packed key or value row
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Query heads sharing one key/value head
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    fn validate(&self) -> Result<()> {
        if self.num_heads == 0
            || self.num_kv_heads == 0
            || self.head_dim == 0
            || self.num_heads % self.num_kv_heads != 0
        {
            return Err(InferirError::shape(format!(
                "Invalid attention heads: {} query, {} kv, dim {}",
                self.num_heads, self.num_kv_heads, self.head_dim
            )));
        }
        Ok(())
    }
}

/// Scaled dot-product attention for `T` query rows against `L` cached rows
///
/// - `q`: `[T, num_heads * head_dim]`
/// - `keys`, `values`: `[L, num_kv_heads * head_dim]` with `L >= T`
/// - `scores`: scratch of at least `T * L` elements
/// - `out`: `[T, num_heads * head_dim]`, overwritten
///
/// Scores are scaled by `1 / sqrt(head_dim)` and masked to the causal window
/// inside [`fused_scale_mask_softmax`] with offset `L - T`.
///
/// # Errors
///
/// Returns `ShapeMismatch` if any buffer disagrees with `shape`, or if fewer
/// key rows than query rows are supplied
#[allow(clippy::too_many_arguments)]
pub fn causal_attention(
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    shape: AttentionShape,
    scores: &mut [f32],
    out: &mut [f32],
    parallel_threshold: usize,
) -> Result<()> {
    shape.validate()?;
    let (q_dim, kv_dim, d) = (shape.q_dim(), shape.kv_dim(), shape.head_dim);
    if q.len() % q_dim != 0 || keys.len() % kv_dim != 0 || keys.len() != values.len() {
        return Err(InferirError::shape(format!(
            "Attention inputs q {} / k {} / v {} are not whole rows of {q_dim} / {kv_dim}",
            q.len(),
            keys.len(),
            values.len()
        )));
    }
    let t = q.len() / q_dim;
    let l = keys.len() / kv_dim;
    if t == 0 {
        return Ok(());
    }
    if l < t {
        return Err(InferirError::shape(format!(
            "Attention over {l} key rows for {t} queries"
        )));
    }
    if out.len() != q.len() || scores.len() < t * l {
        return Err(InferirError::shape(format!(
            "Attention output {} (want {}) or scores {} (want {}) too small",
            out.len(),
            q.len(),
            scores.len(),
            t * l
        )));
    }

    let scale = 1.0 / (d as f32).sqrt();
    let offset = l - t;
    let group = shape.group_size();
    let scores = &mut scores[..t * l];

    for h in 0..shape.num_heads {
        let kvh = h / group;
        let q_head = MatView::strided(q, h * d, t, d, q_dim)?;
        let k_head = MatView::strided(keys, kvh * d, l, d, kv_dim)?;
        let v_head = MatView::strided(values, kvh * d, l, d, kv_dim)?;

        let mut s = MatViewMut::new(scores, t, l)?;
        matmul_transpose_b_into_with(q_head, k_head, &mut s, parallel_threshold)?;
        fused_scale_mask_softmax(&mut s, scale, offset)?;

        let mut o_head = MatViewMut::strided(out, h * d, t, d, q_dim)?;
        matmul_into_with(s.as_view(), v_head, &mut o_head, parallel_threshold)?;
    }
    Ok(())
}
