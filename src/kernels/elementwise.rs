//! Normalization and activation kernels
//!
//! All operate row-wise on packed `[rows, dim]` buffers, in place or into a
//! caller-provided output so the forward pass can run on pooled scratch.

use crate::error::{InferirError, Result};

fn check_row_len(op: &str, len: usize, dim: usize) -> Result<()> {
    if dim == 0 || len % dim != 0 {
        return Err(InferirError::shape(format!(
            "{op}: buffer of {len} is not a whole number of rows of {dim}"
        )));
    }
    Ok(())
}

/// Layer normalization over each `dim`-wide row of `input` into `output`
///
/// `y = (x - mean) / sqrt(var + eps) * weight + bias`
///
/// # Errors
///
/// Returns `ShapeMismatch` if lengths disagree or `weight`/`bias` are not
/// `dim` wide
pub fn layer_norm(
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    eps: f32,
    output: &mut [f32],
) -> Result<()> {
    let dim = weight.len();
    check_row_len("layer_norm", input.len(), dim)?;
    if output.len() != input.len() || bias.is_some_and(|b| b.len() != dim) {
        return Err(InferirError::shape(format!(
            "layer_norm: input {} output {} weight {dim}",
            input.len(),
            output.len()
        )));
    }

    #[allow(clippy::cast_precision_loss)]
    let n = dim as f32;
    for (x, y) in input.chunks_exact(dim).zip(output.chunks_exact_mut(dim)) {
        let mean = x.iter().sum::<f32>() / n;
        let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + eps).sqrt();
        for (i, (o, v)) in y.iter_mut().zip(x).enumerate() {
            *o = (v - mean) * inv_std * weight[i];
            if let Some(b) = bias {
                *o += b[i];
            }
        }
    }
    Ok(())
}

/// RMS normalization: `y = x / sqrt(mean(x²) + eps) * weight`
///
/// # Errors
///
/// Returns `ShapeMismatch` if lengths disagree
pub fn rms_norm(input: &[f32], weight: &[f32], eps: f32, output: &mut [f32]) -> Result<()> {
    let dim = weight.len();
    check_row_len("rms_norm", input.len(), dim)?;
    if output.len() != input.len() {
        return Err(InferirError::shape(format!(
            "rms_norm: input {} output {}",
            input.len(),
            output.len()
        )));
    }

    #[allow(clippy::cast_precision_loss)]
    let n = dim as f32;
    for (x, y) in input.chunks_exact(dim).zip(output.chunks_exact_mut(dim)) {
        let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / n;
        let inv_rms = 1.0 / (mean_sq + eps).sqrt();
        for ((o, v), w) in y.iter_mut().zip(x).zip(weight) {
            *o = v * inv_rms * w;
        }
    }
    Ok(())
}

/// GELU (tanh approximation) in place
pub fn gelu_in_place(x: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    const C: f32 = 0.044_715;
    for v in x.iter_mut() {
        let inner = SQRT_2_OVER_PI * (*v + C * *v * *v * *v);
        *v = 0.5 * *v * (1.0 + inner.tanh());
    }
}

/// SiLU (`x * sigmoid(x)`) in place
pub fn silu_in_place(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v /= 1.0 + (-*v).exp();
    }
}

/// Add a per-column bias to every `bias.len()`-wide row
pub fn add_bias(x: &mut [f32], bias: &[f32]) {
    if bias.is_empty() {
        return;
    }
    for row in x.chunks_exact_mut(bias.len()) {
        for (v, b) in row.iter_mut().zip(bias) {
            *v += b;
        }
    }
}

/// Index of the largest element; ties resolve to the lowest index
#[must_use]
pub fn argmax(x: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in x.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {},
            _ if v.is_nan() => {},
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
