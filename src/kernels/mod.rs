//! Numeric kernels
//!
//! Vectorized primitives the model is built from:
//!
//! - [`dot`], [`axpy`] and friends: lane-chunked vector ops
//! - [`matmul`], [`matmul_transpose_b`]: matrix multiply over strided views,
//!   fanning out on rayon above a size threshold
//! - [`fused_scale_mask_softmax`]: attention softmax with causal window
//! - [`layer_norm`], [`rms_norm`], [`gelu_in_place`], [`silu_in_place`]
//!
//! Kernels validate dimensions before touching data and report
//! `ShapeMismatch`. They never inspect values, so NaN and infinity propagate
//! to the caller unchanged.

mod elementwise;
mod matmul;
mod simd;
mod softmax;
mod view;

pub use elementwise::{add_bias, argmax, gelu_in_place, layer_norm, rms_norm, silu_in_place};
pub use matmul::{
    matmul_into, matmul_into_with, matmul_transpose_b_into, matmul_transpose_b_into_with,
    DEFAULT_PARALLEL_THRESHOLD,
};
pub use simd::{add_assign, axpy, dot, exp_shifted_sum, max, mul_assign, scale, scale_max, LANES};
pub use softmax::{fused_scale_mask_softmax, softmax_in_place};
pub use view::{MatView, MatViewMut};

use crate::error::{InferirError, Result};
use crate::tensor::Tensor;

fn as_matrix(t: &Tensor, name: &str) -> Result<(usize, usize)> {
    match t.shape() {
        [r, c] => Ok((*r, *c)),
        other => Err(InferirError::shape(format!(
            "{name} must be 2-D, got {other:?}"
        ))),
    }
}

/// `A · B` for 2-D tensors, allocating the result
///
/// # Errors
///
/// Returns `ShapeMismatch` if either operand is not 2-D or inner
/// dimensions differ
///
/// # Example
///
/// ```
/// use inferir::{kernels::matmul, Tensor};
///
/// let a = Tensor::from_vec(vec![1, 2], vec![1.0, 2.0]).unwrap();
/// let b = Tensor::from_vec(vec![2, 1], vec![3.0, 4.0]).unwrap();
/// assert_eq!(matmul(&a, &b).unwrap().data(), &[11.0]);
/// ```
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k) = as_matrix(a, "A")?;
    let (k2, n) = as_matrix(b, "B")?;
    if k != k2 {
        return Err(InferirError::shape(format!(
            "matmul inner dimensions differ: [{m}x{k}] · [{k2}x{n}]"
        )));
    }
    let mut out = Tensor::zeros(vec![m, n])?;
    let mut c = MatViewMut::new(out.data_mut(), m, n)?;
    matmul_into(MatView::new(a.data(), m, k)?, MatView::new(b.data(), k, n)?, &mut c)?;
    Ok(out)
}

/// `A · Bᵀ` for 2-D tensors without materializing the transpose
///
/// # Errors
///
/// Returns `ShapeMismatch` if either operand is not 2-D or their last
/// dimensions differ
pub fn matmul_transpose_b(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k) = as_matrix(a, "A")?;
    let (n, k2) = as_matrix(b, "B")?;
    if k != k2 {
        return Err(InferirError::shape(format!(
            "matmul_transpose_b inner dimensions differ: [{m}x{k}] · [{n}x{k2}]ᵀ"
        )));
    }
    let mut out = Tensor::zeros(vec![m, n])?;
    let mut c = MatViewMut::new(out.data_mut(), m, n)?;
    matmul_transpose_b_into(MatView::new(a.data(), m, k)?, MatView::new(b.data(), n, k)?, &mut c)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_matmul_and_transpose_agree() {
        let a = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("test");
        let b = Tensor::from_vec(vec![3, 2], vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]).expect("test");
        let bt = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("test");
        let c1 = matmul(&a, &b).expect("test");
        let c2 = matmul_transpose_b(&a, &bt).expect("test");
        assert_eq!(c1.shape(), &[2, 2]);
        assert_eq!(c1.data(), c2.data());
        assert_eq!(c1.data(), &[14.0, 32.0, 32.0, 77.0]);
    }

    #[test]
    fn test_tensor_matmul_rank_error() {
        let a = Tensor::zeros(vec![2, 2, 2]).expect("test");
        let b = Tensor::zeros(vec![2, 2]).expect("test");
        assert!(matches!(
            matmul(&a, &b),
            Err(InferirError::ShapeMismatch { .. })
        ));
        let c = Tensor::zeros(vec![3, 3]).expect("test");
        assert!(matmul_transpose_b(&b, &c).is_err());
    }
}
