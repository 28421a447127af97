//! Rotary position embeddings
//!
//! For each pair of dimensions `(2i, 2i+1)` of a head:
//!
//! ```text
//! x'_{2i}   = x_{2i} * cos(θ_i * pos) - x_{2i+1} * sin(θ_i * pos)
//! x'_{2i+1} = x_{2i} * sin(θ_i * pos) + x_{2i+1} * cos(θ_i * pos)
//! ```
//!
//! where `θ_i = base^(-2i/head_dim)`. The angle table is computed once per
//! model for every position up to the context length; applying it is a
//! table lookup, so the cached and full-block paths see identical values for
//! the same absolute position.

use crate::error::{InferirError, Result};

/// Precomputed cos/sin table `[positions, head_dim / 2]`
#[derive(Debug, Clone)]
pub struct RopeTable {
    head_dim: usize,
    max_positions: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RopeTable {
    /// Build the table for `max_positions` positions
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `head_dim` is zero or odd, or `max_positions`
    /// is zero
    pub fn new(head_dim: usize, max_positions: usize, base: f32) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 || max_positions == 0 {
            return Err(InferirError::validation(format!(
                "RoPE needs an even head_dim and at least one position, got {head_dim} / {max_positions}"
            )));
        }
        let half = head_dim / 2;
        #[allow(clippy::cast_precision_loss)]
        let inv_freq: Vec<f64> = (0..half)
            .map(|i| f64::from(base).powf(-((2 * i) as f64) / head_dim as f64))
            .collect();

        let mut cos = Vec::with_capacity(max_positions * half);
        let mut sin = Vec::with_capacity(max_positions * half);
        for pos in 0..max_positions {
            for f in &inv_freq {
                #[allow(clippy::cast_precision_loss)]
                let angle = pos as f64 * f;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        Ok(Self {
            head_dim,
            max_positions,
            cos,
            sin,
        })
    }

    /// Head width the table was built for
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Positions covered
    #[must_use]
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Rotate every head of consecutive packed rows in place
    ///
    /// `x` is `[rows, heads * head_dim]`; row `r` sits at absolute position
    /// `start_pos + r`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `x` is not whole rows of `row_width` or
    /// `row_width` is not whole heads, and `Validation` if a position is
    /// beyond the table
    pub fn apply(&self, x: &mut [f32], row_width: usize, start_pos: usize) -> Result<()> {
        if row_width == 0 || row_width % self.head_dim != 0 || x.len() % row_width != 0 {
            return Err(InferirError::shape(format!(
                "RoPE input {} with row width {row_width} and head_dim {}",
                x.len(),
                self.head_dim
            )));
        }
        let rows = x.len() / row_width;
        if start_pos + rows > self.max_positions {
            return Err(InferirError::validation(format!(
                "RoPE position {} beyond table of {}",
                start_pos + rows - 1,
                self.max_positions
            )));
        }

        let half = self.head_dim / 2;
        for (r, row) in x.chunks_exact_mut(row_width).enumerate() {
            let base = (start_pos + r) * half;
            let cos = &self.cos[base..base + half];
            let sin = &self.sin[base..base + half];
            for head in row.chunks_exact_mut(self.head_dim) {
                for (pair, (c, s)) in head.chunks_exact_mut(2).zip(cos.iter().zip(sin)) {
                    let (x0, x1) = (pair[0], pair[1]);
                    pair[0] = x0 * c - x1 * s;
                    pair[1] = x0 * s + x1 * c;
                }
            }
        }
        Ok(())
    }
}
