//! Lane-chunked vector primitives
//!
//! Every primitive processes the input in `LANES`-wide chunks with
//! independent accumulators (a shape the compiler lowers to SIMD registers on
//! x86 AVX, ARM NEON and WASM SIMD) and finishes the remainder with scalar
//! code. Accumulation order depends only on input length, never on the host,
//! so results are bit-identical across machines.

/// Chunk width for vectorized paths
pub const LANES: usize = 8;

/// Dot product of two equal-length slices
///
/// # Example
///
/// ```
/// use inferir::kernels::dot;
///
/// let a = vec![1.0, 2.0, 3.0];
/// let b = vec![4.0, 5.0, 6.0];
/// assert!((dot(&a, &b) - 32.0).abs() < 1e-5);
/// ```
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "dot: length mismatch");
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let (rem_a, rem_b) = (chunks_a.remainder(), chunks_b.remainder());

    let mut acc = [0.0f32; LANES];
    for (x, y) in chunks_a.zip(chunks_b) {
        for lane in 0..LANES {
            acc[lane] += x[lane] * y[lane];
        }
    }

    let mut sum = reduce_sum(&acc);
    for (x, y) in rem_a.iter().zip(rem_b) {
        sum += x * y;
    }
    sum
}

/// `y += alpha * x`
#[inline]
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len(), "axpy: length mismatch");
    let mut chunks_y = y.chunks_exact_mut(LANES);
    let mut chunks_x = x.chunks_exact(LANES);
    for (yc, xc) in (&mut chunks_y).zip(&mut chunks_x) {
        for lane in 0..LANES {
            yc[lane] += alpha * xc[lane];
        }
    }
    for (yv, xv) in chunks_y
        .into_remainder()
        .iter_mut()
        .zip(chunks_x.remainder())
    {
        *yv += alpha * xv;
    }
}

/// Element-wise `a += b`
#[inline]
pub fn add_assign(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len(), "add_assign: length mismatch");
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

/// Element-wise `a *= b`
#[inline]
pub fn mul_assign(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len(), "mul_assign: length mismatch");
    for (x, y) in a.iter_mut().zip(b) {
        *x *= y;
    }
}

/// Multiply every element by `factor`
#[inline]
pub fn scale(a: &mut [f32], factor: f32) {
    let mut chunks = a.chunks_exact_mut(LANES);
    for c in &mut chunks {
        for lane in 0..LANES {
            c[lane] *= factor;
        }
    }
    for x in chunks.into_remainder() {
        *x *= factor;
    }
}

#[inline]
fn reduce_max(acc: &[f32; LANES]) -> f32 {
    (acc[0].max(acc[4]).max(acc[1].max(acc[5]))).max(acc[2].max(acc[6]).max(acc[3].max(acc[7])))
}

#[inline]
fn reduce_sum(acc: &[f32; LANES]) -> f32 {
    ((acc[0] + acc[4]) + (acc[1] + acc[5])) + ((acc[2] + acc[6]) + (acc[3] + acc[7]))
}

/// Largest element, `NEG_INFINITY` for an empty slice
#[inline]
#[must_use]
pub fn max(a: &[f32]) -> f32 {
    let chunks = a.chunks_exact(LANES);
    let rem = chunks.remainder();
    let mut acc = [f32::NEG_INFINITY; LANES];
    for c in chunks {
        for lane in 0..LANES {
            acc[lane] = acc[lane].max(c[lane]);
        }
    }
    rem.iter().fold(reduce_max(&acc), |m, &x| m.max(x))
}

/// [`scale`] fused with [`max`] over the scaled values
#[inline]
pub fn scale_max(a: &mut [f32], factor: f32) -> f32 {
    let mut acc = [f32::NEG_INFINITY; LANES];
    let mut chunks = a.chunks_exact_mut(LANES);
    for c in &mut chunks {
        for lane in 0..LANES {
            c[lane] *= factor;
            acc[lane] = acc[lane].max(c[lane]);
        }
    }
    let mut m = reduce_max(&acc);
    for x in chunks.into_remainder() {
        *x *= factor;
        m = m.max(*x);
    }
    m
}

/// Replace every `x` with `exp(x - shift)` and return the sum of the results
#[inline]
pub fn exp_shifted_sum(a: &mut [f32], shift: f32) -> f32 {
    let mut acc = [0.0f32; LANES];
    let mut chunks = a.chunks_exact_mut(LANES);
    for c in &mut chunks {
        for lane in 0..LANES {
            c[lane] = (c[lane] - shift).exp();
            acc[lane] += c[lane];
        }
    }
    let mut sum = reduce_sum(&acc);
    for x in chunks.into_remainder() {
        *x = (*x - shift).exp();
        sum += *x;
    }
    sum
}
