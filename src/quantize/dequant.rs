//! Block dequantization
//!
//! One decoder per kind, each expanding exactly one block into its output
//! slice. [`dequantize_into`] validates the byte length against the kind and
//! element count, then walks the blocks (in parallel on rayon for large
//! tensors, by whole block groups so results do not depend on scheduling).

use rayon::prelude::*;

use super::{QuantKind, BLOCK_SIZE};
use crate::error::{InferirError, Result};

/// Element count at which dequantization fans out across threads
const PARALLEL_MIN_ELEMENTS: usize = 1 << 16;

/// Blocks handed to one rayon task
const BLOCKS_PER_TASK: usize = 64;

#[inline]
pub(crate) fn read_f16(bytes: &[u8]) -> f32 {
    half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

#[inline]
fn block_f32(block: &[u8], out: &mut [f32]) {
    out[0] = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
}

#[inline]
fn block_f16(block: &[u8], out: &mut [f32]) {
    out[0] = read_f16(block);
}

/// `Q8_0`: f16 scale followed by 32 signed bytes
#[inline]
fn block_q8_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    for (o, &q) in out.iter_mut().zip(&block[2..2 + BLOCK_SIZE]) {
        *o = d * f32::from(q as i8);
    }
}

/// `Q4_0`: f16 scale and 16 bytes. Low nibbles fill positions 0-15, high
/// nibbles positions 16-31, both offset by 8.
#[inline]
fn block_q4_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    let (lo, hi) = out.split_at_mut(BLOCK_SIZE / 2);
    for (j, &byte) in block[2..18].iter().enumerate() {
        lo[j] = d * f32::from(i16::from(byte & 0x0F) - 8);
        hi[j] = d * f32::from(i16::from(byte >> 4) - 8);
    }
}

/// `Q4_1`: f16 scale, f16 min and 16 bytes, `value = q * d + min`
#[inline]
fn block_q4_1(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    let min = read_f16(&block[2..4]);
    let (lo, hi) = out.split_at_mut(BLOCK_SIZE / 2);
    for (j, &byte) in block[4..20].iter().enumerate() {
        lo[j] = d * f32::from(byte & 0x0F) + min;
        hi[j] = d * f32::from(byte >> 4) + min;
    }
}

/// Unpack the 6-bit scale and min of sub-block `j` from the 12-byte table
#[inline]
pub(crate) fn extract_scale_min(scales: &[u8], j: usize) -> (f32, f32) {
    let (sc, m) = if j < 4 {
        (scales[j] & 63, scales[j + 4] & 63)
    } else {
        (
            (scales[j + 4] & 0x0F) | ((scales[j - 4] >> 6) << 4),
            (scales[j + 4] >> 4) | ((scales[j] >> 6) << 4),
        )
    };
    (f32::from(sc), f32::from(m))
}

/// `Q4_K` super-block: d, dmin, 12 packed scale bytes, 128 nibble bytes.
/// Each 64-value span emits 32 low nibbles then 32 high nibbles.
#[inline]
fn block_q4_k(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    let dmin = read_f16(&block[2..4]);
    let scales = &block[4..16];
    let qs = &block[16..144];

    for (span, chunk) in out.chunks_exact_mut(64).enumerate() {
        let q = &qs[span * 32..span * 32 + 32];
        let (sc1, m1) = extract_scale_min(scales, span * 2);
        let (sc2, m2) = extract_scale_min(scales, span * 2 + 1);
        let (d1, dm1) = (d * sc1, dmin * m1);
        let (d2, dm2) = (d * sc2, dmin * m2);
        let (lo, hi) = chunk.split_at_mut(32);
        for (l, &byte) in q.iter().enumerate() {
            lo[l] = d1 * f32::from(byte & 0x0F) - dm1;
            hi[l] = d2 * f32::from(byte >> 4) - dm2;
        }
    }
}

/// `Q6_K` super-block: 128 low-nibble bytes, 64 high-bit bytes, 16 signed
/// scales, then the f16 super-block scale
#[inline]
fn block_q6_k(block: &[u8], out: &mut [f32]) {
    let ql = &block[0..128];
    let qh = &block[128..192];
    let scales = &block[192..208];
    let d = read_f16(&block[208..210]);

    for half_idx in 0..2 {
        let ql = &ql[64 * half_idx..];
        let qh = &qh[32 * half_idx..];
        let sc = &scales[8 * half_idx..];
        let out = &mut out[128 * half_idx..];
        for l in 0..32 {
            let is = l / 16;
            let q1 = i32::from((ql[l] & 0x0F) | ((qh[l] & 3) << 4)) - 32;
            let q2 = i32::from((ql[l + 32] & 0x0F) | (((qh[l] >> 2) & 3) << 4)) - 32;
            let q3 = i32::from((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) - 32;
            let q4 = i32::from((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) - 32;
            #[allow(clippy::cast_precision_loss)]
            {
                out[l] = d * f32::from(sc[is] as i8) * q1 as f32;
                out[l + 32] = d * f32::from(sc[is + 2] as i8) * q2 as f32;
                out[l + 64] = d * f32::from(sc[is + 4] as i8) * q3 as f32;
                out[l + 96] = d * f32::from(sc[is + 6] as i8) * q4 as f32;
            }
        }
    }
}

#[inline]
fn run_blocks(
    data: &[u8],
    out: &mut [f32],
    block_bytes: usize,
    block_size: usize,
    f: impl Fn(&[u8], &mut [f32]),
) {
    for (block, o) in data
        .chunks_exact(block_bytes)
        .zip(out.chunks_exact_mut(block_size))
    {
        f(block, o);
    }
}

/// Decode whole blocks; lengths were validated by the caller
fn decode_blocks(kind: QuantKind, data: &[u8], out: &mut [f32]) {
    let (bb, bs) = (kind.block_bytes(), kind.block_size());
    match kind {
        QuantKind::F32 => run_blocks(data, out, bb, bs, block_f32),
        QuantKind::F16 => run_blocks(data, out, bb, bs, block_f16),
        QuantKind::Q4_0 => run_blocks(data, out, bb, bs, block_q4_0),
        QuantKind::Q4_1 => run_blocks(data, out, bb, bs, block_q4_1),
        QuantKind::Q8_0 => run_blocks(data, out, bb, bs, block_q8_0),
        QuantKind::Q4_K => run_blocks(data, out, bb, bs, block_q4_k),
        QuantKind::Q6_K => run_blocks(data, out, bb, bs, block_q6_k),
    }
}

/// Dequantize `data` of the given kind into `out`
///
/// `out.len()` is the element count; `data` must hold exactly
/// `kind.byte_size(out.len())` bytes.
///
/// # Errors
///
/// Returns `Format` if the element count is not a whole number of blocks or
/// the byte length disagrees with it
pub fn dequantize_into(kind: QuantKind, data: &[u8], out: &mut [f32]) -> Result<()> {
    let expected = kind.byte_size(out.len())?;
    if data.len() != expected {
        return Err(InferirError::format(format!(
            "{kind} data is {} bytes, {} elements require {expected}",
            data.len(),
            out.len()
        )));
    }

    if out.len() >= PARALLEL_MIN_ELEMENTS {
        let elems_per_task = kind.block_size() * BLOCKS_PER_TASK;
        let bytes_per_task = kind.block_bytes() * BLOCKS_PER_TASK;
        out.par_chunks_mut(elems_per_task)
            .zip(data.par_chunks(bytes_per_task))
            .for_each(|(o, d)| decode_blocks(kind, d, o));
    } else {
        decode_blocks(kind, data, out);
    }
    Ok(())
}

/// Dequantize `elements` values into a fresh vector
///
/// # Errors
///
/// See [`dequantize_into`]
pub fn dequantize(kind: QuantKind, data: &[u8], elements: usize) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; elements];
    dequantize_into(kind, data, &mut out)?;
    Ok(out)
}
