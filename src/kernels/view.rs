//! Strided matrix views over shared backing buffers
//!
//! Kernels take views rather than slices so callers can address a sub-matrix
//! (one attention head inside a packed `[T, H * D]` projection, the first `p`
//! rows of a KV cache arena) without copying.

use crate::error::{InferirError, Result};

/// Read-only row-major matrix view: element `(r, c)` lives at
/// `data[offset + r * stride + c]`
#[derive(Debug, Clone, Copy)]
pub struct MatView<'a> {
    data: &'a [f32],
    offset: usize,
    rows: usize,
    cols: usize,
    stride: usize,
}

/// Mutable counterpart of [`MatView`]
#[derive(Debug)]
pub struct MatViewMut<'a> {
    data: &'a mut [f32],
    offset: usize,
    rows: usize,
    cols: usize,
    stride: usize,
}

fn check_bounds(
    len: usize,
    offset: usize,
    rows: usize,
    cols: usize,
    stride: usize,
) -> Result<()> {
    if cols > stride {
        return Err(InferirError::shape(format!(
            "View cols {cols} exceed stride {stride}"
        )));
    }
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    let end = (rows - 1)
        .checked_mul(stride)
        .and_then(|n| n.checked_add(offset))
        .and_then(|n| n.checked_add(cols));
    match end {
        Some(end) if end <= len => Ok(()),
        _ => Err(InferirError::shape(format!(
            "View [{rows}x{cols}] at offset {offset} stride {stride} exceeds buffer of {len}"
        ))),
    }
}

impl<'a> MatView<'a> {
    /// Contiguous `rows × cols` view over the start of `data`
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `data` is shorter than `rows * cols`
    pub fn new(data: &'a [f32], rows: usize, cols: usize) -> Result<Self> {
        Self::strided(data, 0, rows, cols, cols)
    }

    /// View starting at `offset` whose rows are `stride` elements apart
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `cols > stride` or the last row runs past
    /// the end of `data`
    pub fn strided(
        data: &'a [f32],
        offset: usize,
        rows: usize,
        cols: usize,
        stride: usize,
    ) -> Result<Self> {
        check_bounds(data.len(), offset, rows, cols, stride)?;
        Ok(Self {
            data,
            offset,
            rows,
            cols,
            stride,
        })
    }

    /// Number of rows
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Borrow row `r`; panics if `r >= rows` (bounds were validated at construction)
    #[inline]
    #[must_use]
    pub fn row(&self, r: usize) -> &'a [f32] {
        debug_assert!(r < self.rows);
        let start = self.offset + r * self.stride;
        &self.data[start..start + self.cols]
    }

    /// Whether rows are packed back to back
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.stride == self.cols || self.rows <= 1
    }
}

impl<'a> MatViewMut<'a> {
    /// Contiguous mutable view over the start of `data`
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `data` is shorter than `rows * cols`
    pub fn new(data: &'a mut [f32], rows: usize, cols: usize) -> Result<Self> {
        Self::strided(data, 0, rows, cols, cols)
    }

    /// Strided mutable view
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the view does not fit in `data`
    pub fn strided(
        data: &'a mut [f32],
        offset: usize,
        rows: usize,
        cols: usize,
        stride: usize,
    ) -> Result<Self> {
        check_bounds(data.len(), offset, rows, cols, stride)?;
        Ok(Self {
            data,
            offset,
            rows,
            cols,
            stride,
        })
    }

    /// Number of rows
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Mutable row `r`
    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        debug_assert!(r < self.rows);
        let start = self.offset + r * self.stride;
        &mut self.data[start..start + self.cols]
    }

    /// Read-only reborrow
    #[must_use]
    pub fn as_view(&self) -> MatView<'_> {
        MatView {
            data: &*self.data,
            offset: self.offset,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride,
        }
    }

    /// Packed backing region when rows are back to back
    pub(crate) fn contiguous_mut(&mut self) -> Option<&mut [f32]> {
        if self.stride == self.cols || self.rows <= 1 {
            let len = self.rows * self.cols;
            Some(&mut self.data[self.offset..self.offset + len])
        } else {
            None
        }
    }
}
