//! Matrix multiply kernels
//!
//! Each output element is a single [`dot`] or a fixed sequence of [`axpy`]
//! updates, so the result of a row does not depend on which thread computes
//! it. Parallel and serial paths are bit-identical.

use rayon::prelude::*;

use super::simd::{axpy, dot};
use super::view::{MatView, MatViewMut};
use crate::error::{InferirError, Result};

/// Multiply-add count above which matmul fans out across the rayon pool
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 18;

/// Output columns per parallel task when the output is a single row
const COL_CHUNK: usize = 64;

fn should_parallelize(m: usize, n: usize, k: usize, threshold: usize) -> bool {
    rayon::current_num_threads() > 1 && m.saturating_mul(n).saturating_mul(k) >= threshold
}

/// `C = A · B` with A `[M×K]`, B `[K×N]`, C `[M×N]`
///
/// # Errors
///
/// Returns `ShapeMismatch` if the inner or outer dimensions disagree
pub fn matmul_into(a: MatView<'_>, b: MatView<'_>, c: &mut MatViewMut<'_>) -> Result<()> {
    matmul_into_with(a, b, c, DEFAULT_PARALLEL_THRESHOLD)
}

/// [`matmul_into`] with an explicit parallel threshold
///
/// # Errors
///
/// Returns `ShapeMismatch` if the inner or outer dimensions disagree
pub fn matmul_into_with(
    a: MatView<'_>,
    b: MatView<'_>,
    c: &mut MatViewMut<'_>,
    threshold: usize,
) -> Result<()> {
    let (m, k, n) = (a.rows(), a.cols(), b.cols());
    if b.rows() != k || c.rows() != m || c.cols() != n {
        return Err(InferirError::shape(format!(
            "matmul: A[{m}x{k}] · B[{}x{n}] -> C[{}x{}]",
            b.rows(),
            c.rows(),
            c.cols()
        )));
    }

    let row_kernel = |i: usize, out: &mut [f32]| {
        out.fill(0.0);
        let a_row = a.row(i);
        for (p, &alpha) in a_row.iter().enumerate() {
            axpy(alpha, b.row(p), out);
        }
    };

    if m > 1 && should_parallelize(m, n, k, threshold) {
        if let Some(packed) = c.contiguous_mut() {
            packed
                .par_chunks_mut(n)
                .enumerate()
                .for_each(|(i, out)| row_kernel(i, out));
            return Ok(());
        }
    }
    for i in 0..m {
        row_kernel(i, c.row_mut(i));
    }
    Ok(())
}

/// `C = A · Bᵀ` with A `[M×K]`, B `[N×K]`, C `[M×N]`
///
/// Reads B row-wise, so weights stored `[out, in]` and cached keys stored
/// `[pos, dim]` are used without materializing a transpose.
///
/// # Errors
///
/// Returns `ShapeMismatch` if the inner or outer dimensions disagree
pub fn matmul_transpose_b_into(
    a: MatView<'_>,
    b: MatView<'_>,
    c: &mut MatViewMut<'_>,
) -> Result<()> {
    matmul_transpose_b_into_with(a, b, c, DEFAULT_PARALLEL_THRESHOLD)
}

/// [`matmul_transpose_b_into`] with an explicit parallel threshold
///
/// # Errors
///
/// Returns `ShapeMismatch` if the inner or outer dimensions disagree
pub fn matmul_transpose_b_into_with(
    a: MatView<'_>,
    b: MatView<'_>,
    c: &mut MatViewMut<'_>,
    threshold: usize,
) -> Result<()> {
    let (m, k, n) = (a.rows(), a.cols(), b.rows());
    if b.cols() != k || c.rows() != m || c.cols() != n {
        return Err(InferirError::shape(format!(
            "matmul_transpose_b: A[{m}x{k}] · B[{n}x{}]ᵀ -> C[{}x{}]",
            b.cols(),
            c.rows(),
            c.cols()
        )));
    }

    if should_parallelize(m, n, k, threshold) {
        if let Some(packed) = c.contiguous_mut() {
            if m == 1 {
                // Decode step: fan out across output columns instead of rows
                let a_row = a.row(0);
                packed
                    .par_chunks_mut(COL_CHUNK)
                    .enumerate()
                    .for_each(|(chunk, out)| {
                        let base = chunk * COL_CHUNK;
                        for (j, o) in out.iter_mut().enumerate() {
                            *o = dot(a_row, b.row(base + j));
                        }
                    });
            } else {
                packed
                    .par_chunks_mut(n)
                    .enumerate()
                    .for_each(|(i, out)| {
                        let a_row = a.row(i);
                        for (j, o) in out.iter_mut().enumerate() {
                            *o = dot(a_row, b.row(j));
                        }
                    });
            }
            return Ok(());
        }
    }

    for i in 0..m {
        let a_row = a.row(i);
        let out = c.row_mut(i);
        for (j, o) in out.iter_mut().enumerate() {
            *o = dot(a_row, b.row(j));
        }
    }
    Ok(())
}
