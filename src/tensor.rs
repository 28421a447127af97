//! Tensor implementation
//!
//! This module provides the core `Tensor` type: a flat, row-major `f32`
//! buffer with a shape. Element counts are validated against a 32-bit index
//! space at construction so kernels can index with `u32` offsets without
//! silent truncation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};

/// Largest element count a tensor may hold
pub const MAX_ELEMENTS: usize = u32::MAX as usize;

/// N-dimensional `f32` tensor in row-major order
///
/// # Examples
///
/// ```
/// use inferir::Tensor;
///
/// // Create a 2×3 tensor
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Flattened data in row-major order
    data: Vec<f32>,
    /// Shape of the tensor
    shape: Vec<usize>,
}

/// Validate a shape and return its element count
///
/// # Errors
///
/// Returns `ShapeMismatch` if the shape is empty, contains a zero, or its
/// product overflows the 32-bit index space.
pub fn element_count(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() {
        return Err(InferirError::shape("Shape cannot be empty"));
    }
    if shape.contains(&0) {
        return Err(InferirError::shape(format!(
            "Shape dimensions cannot be zero: {shape:?}"
        )));
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .filter(|&n| n <= MAX_ELEMENTS)
        .ok_or_else(|| {
            InferirError::shape(format!(
                "Shape {shape:?} exceeds the {MAX_ELEMENTS}-element index space"
            ))
        })
}

impl Tensor {
    /// Create a new tensor from a shape and row-major data
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Shape is empty or contains zero
    /// - Element count overflows the 32-bit index space
    /// - Data size doesn't match shape
    ///
    /// # Examples
    ///
    /// ```
    /// use inferir::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// assert_eq!(t.shape(), &[2, 2]);
    /// ```
    pub fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = element_count(&shape)?;
        if data.len() != expected {
            return Err(InferirError::shape(format!(
                "Data size {} does not match shape {:?} (expected {})",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// Create a zero-filled tensor
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is invalid (see [`Tensor::from_vec`])
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let n = element_count(&shape)?;
        Ok(Self {
            data: vec![0.0; n],
            shape,
        })
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Get a mutable reference to the underlying data (in-place kernels)
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the tensor, returning its buffer
    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Number of rows when viewed as a matrix (product of all but the last dim)
    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.len() / self.cols()
    }

    /// Size of the last dimension
    #[must_use]
    pub fn cols(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Borrow one row of the matrix view
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `index` is out of range
    pub fn row(&self, index: usize) -> Result<&[f32]> {
        let cols = self.cols();
        if index >= self.rows() {
            return Err(InferirError::shape(format!(
                "Row {index} out of range for shape {:?}",
                self.shape
            )));
        }
        Ok(&self.data[index * cols..(index + 1) * cols])
    }

    /// Reinterpret with a new shape of the same element count
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the element counts differ
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Self::from_vec(shape, self.data)
    }

    /// Whether every element is finite
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data=[", self.shape)?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tensor() {
        let t = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("test");
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.size(), 6);
        assert_eq!(t.rows(), 2);
        assert_eq!(t.cols(), 3);
        assert_eq!(t.row(1).expect("test"), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_empty_shape_error() {
        let result = Tensor::from_vec(vec![], vec![1.0, 2.0]);
        assert!(matches!(result, Err(InferirError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zero_dimension_error() {
        assert!(Tensor::from_vec(vec![2, 0], vec![]).is_err());
    }

    #[test]
    fn test_size_mismatch_error() {
        let result = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0]);
        assert!(matches!(result, Err(InferirError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_oversized_shape_rejected() {
        // 2^20 * 2^20 elements overflows the 32-bit index space
        let result = element_count(&[1 << 20, 1 << 20]);
        assert!(matches!(result, Err(InferirError::ShapeMismatch { .. })));
        // usize overflow is rejected the same way, not wrapped
        assert!(element_count(&[usize::MAX, 2]).is_err());
    }

    #[test]
    fn test_row_out_of_range() {
        let t = Tensor::zeros(vec![2, 2]).expect("test");
        assert!(t.row(2).is_err());
    }

    #[test]
    fn test_reshape() {
        let t = Tensor::zeros(vec![2, 6]).expect("test");
        let r = t.clone().reshape(vec![3, 4]).expect("test");
        assert_eq!(r.shape(), &[3, 4]);
        assert!(t.reshape(vec![5]).is_err());
    }

    #[test]
    fn test_display() {
        let t = Tensor::from_vec(vec![2], vec![1.0, 2.0]).expect("test");
        let display = format!("{t}");
        assert!(display.contains("shape=[2]"));
        assert!(display.contains('1'));
    }

    #[test]
    fn test_is_finite() {
        let mut t = Tensor::zeros(vec![3]).expect("test");
        assert!(t.is_finite());
        t.data_mut()[1] = f32::NAN;
        assert!(!t.is_finite());
    }
}
