//! Softmax kernels
//!
//! [`fused_scale_mask_softmax`] applies the attention scale, the causal mask
//! and a numerically stable softmax in one pass per row. Work is bounded to
//! the valid column window, so a decode step over a long cache touches only
//! the positions it may attend to.

use super::simd::{exp_shifted_sum, max, scale, scale_max};
use super::view::MatViewMut;
use crate::error::{InferirError, Result};

/// Fused `softmax(mask(scores * factor))` in place
///
/// Row `r` is normalized over columns `[0, causal_offset + r + 1)`; every
/// column past that window is set to zero. `causal_offset` is the number of
/// positions already cached before the first query row (0 for a full block).
///
/// # Errors
///
/// Returns `ShapeMismatch` if the last row's window would extend past the
/// number of columns (`causal_offset + rows > cols`).
///
/// # Example
///
/// ```
/// use inferir::kernels::{fused_scale_mask_softmax, MatViewMut};
///
/// let mut scores = vec![1.0, 9.0, 1.0, 1.0];
/// let mut view = MatViewMut::new(&mut scores, 2, 2).unwrap();
/// fused_scale_mask_softmax(&mut view, 1.0, 0).unwrap();
/// // Row 0 attends only to column 0
/// assert_eq!(scores[0], 1.0);
/// assert_eq!(scores[1], 0.0);
/// ```
pub fn fused_scale_mask_softmax(
    scores: &mut MatViewMut<'_>,
    factor: f32,
    causal_offset: usize,
) -> Result<()> {
    let (rows, cols) = (scores.rows(), scores.cols());
    if causal_offset.saturating_add(rows) > cols {
        return Err(InferirError::shape(format!(
            "Causal window {causal_offset}+{rows} exceeds {cols} score columns"
        )));
    }

    for r in 0..rows {
        let valid = causal_offset + r + 1;
        let row = scores.row_mut(r);
        let (window, masked) = row.split_at_mut(valid);

        let row_max = scale_max(window, factor);
        let sum = exp_shifted_sum(window, row_max);
        scale(window, 1.0 / sum);
        masked.fill(0.0);
    }
    Ok(())
}

/// Numerically stable softmax of a single vector in place
pub fn softmax_in_place(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let m = max(x);
    let sum = exp_shifted_sum(x, m);
    scale(x, 1.0 / sum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_block_mask() {
        let mut s = vec![0.5; 9];
        let mut v = MatViewMut::new(&mut s, 3, 3).expect("test");
        fused_scale_mask_softmax(&mut v, 1.0, 0).expect("test");
        assert_eq!(&s[0..3], &[1.0, 0.0, 0.0]);
        assert!((s[3] - 0.5).abs() < 1e-6 && (s[4] - 0.5).abs() < 1e-6);
        assert_eq!(s[5], 0.0);
        for x in &s[6..9] {
            assert!((x - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cached_offset_single_row() {
        // One query row at absolute position 3 attends to all four cached keys
        let mut s = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        let mut v = MatViewMut::new(&mut s, 1, 5).expect("test");
        // Window is [0, 4): column 4 is beyond the cache and must be zeroed
        fused_scale_mask_softmax(&mut v, 0.5, 3).expect("test");
        let sum: f32 = s[..4].iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(s[4], 0.0);
        assert!(s[3] > s[2] && s[2] > s[1]);
    }

    #[test]
    fn test_large_values_stable() {
        let mut s = vec![1000.0, 1001.0];
        let mut v = MatViewMut::new(&mut s, 1, 2).expect("test");
        fused_scale_mask_softmax(&mut v, 1.0, 1).expect("test");
        assert!(s.iter().all(|x| x.is_finite()));
        assert!((s[0] + s[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_overflow_rejected() {
        let mut s = vec![0.0; 4];
        let mut v = MatViewMut::new(&mut s, 2, 2).expect("test");
        assert!(fused_scale_mask_softmax(&mut v, 1.0, 1).is_err());
    }

    #[test]
    fn test_nan_propagates() {
        let mut s = vec![f32::NAN, 1.0];
        let mut v = MatViewMut::new(&mut s, 1, 2).expect("test");
        fused_scale_mask_softmax(&mut v, 1.0, 1).expect("test");
        assert!(s[0].is_nan() || s[1].is_nan());
    }

    #[test]
    fn test_softmax_in_place() {
        let mut x = vec![1.0, 2.0, 3.0];
        softmax_in_place(&mut x);
        assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(x[2] > x[1]);
        let mut empty: Vec<f32> = vec![];
        softmax_in_place(&mut empty);
    }
}
