//! Quantizers for the writable kinds
//!
//! Block layouts mirror the decoders in `dequant`; a value written here and
//! read back differs by at most half a quantization step of its block.

use super::{QuantKind, BLOCK_SIZE};
use crate::error::{InferirError, Result};

fn f16_le(v: f32) -> [u8; 2] {
    half::f16::from_f32(v).to_le_bytes()
}

fn encode_q8_0(block: &[f32], out: &mut Vec<u8>) {
    let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let d = amax / 127.0;
    let id = if d == 0.0 { 0.0 } else { 1.0 / d };
    out.extend_from_slice(&f16_le(d));
    for &v in block {
        #[allow(clippy::cast_possible_truncation)]
        let q = (v * id).round().clamp(-127.0, 127.0) as i8;
        out.push(q as u8);
    }
}

fn encode_q4_0(block: &[f32], out: &mut Vec<u8>) {
    // Signed value of largest magnitude maps to -8
    let max = block
        .iter()
        .copied()
        .fold(0.0f32, |m, v| if v.abs() > m.abs() { v } else { m });
    let d = max / -8.0;
    let id = if d == 0.0 { 0.0 } else { 1.0 / d };
    out.extend_from_slice(&f16_le(d));
    let half = BLOCK_SIZE / 2;
    for j in 0..half {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nib = |v: f32| (v * id + 8.5).clamp(0.0, 15.0) as u8;
        out.push(nib(block[j]) | (nib(block[j + half]) << 4));
    }
}

fn encode_q4_1(block: &[f32], out: &mut Vec<u8>) {
    let min = block.iter().copied().fold(f32::INFINITY, f32::min);
    let max = block.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let d = (max - min) / 15.0;
    let id = if d == 0.0 { 0.0 } else { 1.0 / d };
    out.extend_from_slice(&f16_le(d));
    out.extend_from_slice(&f16_le(min));
    let half = BLOCK_SIZE / 2;
    for j in 0..half {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nib = |v: f32| ((v - min) * id + 0.5).clamp(0.0, 15.0) as u8;
        out.push(nib(block[j]) | (nib(block[j + half]) << 4));
    }
}

/// Encode `values` as `kind`
///
/// # Errors
///
/// Returns `Validation` for kinds without an encoder (`Q4_K`, `Q6_K`) and
/// `ShapeMismatch` if `values` is not a whole number of blocks
///
/// # Example
///
/// ```
/// use inferir::quantize::{dequantize, quantize, QuantKind};
///
/// let values: Vec<f32> = (0..32).map(|i| i as f32 / 8.0).collect();
/// let bytes = quantize(QuantKind::Q8_0, &values).unwrap();
/// assert_eq!(bytes.len(), 34);
/// let back = dequantize(QuantKind::Q8_0, &bytes, 32).unwrap();
/// assert!((back[31] - values[31]).abs() < 0.05);
/// ```
pub fn quantize(kind: QuantKind, values: &[f32]) -> Result<Vec<u8>> {
    if values.len() % kind.block_size() != 0 {
        return Err(InferirError::shape(format!(
            "{} values are not a whole number of {kind} blocks of {}",
            values.len(),
            kind.block_size()
        )));
    }

    let mut out = Vec::with_capacity(kind.byte_size(values.len())?);
    match kind {
        QuantKind::F32 => {
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        },
        QuantKind::F16 => {
            for &v in values {
                out.extend_from_slice(&f16_le(v));
            }
        },
        QuantKind::Q8_0 => values
            .chunks_exact(BLOCK_SIZE)
            .for_each(|b| encode_q8_0(b, &mut out)),
        QuantKind::Q4_0 => values
            .chunks_exact(BLOCK_SIZE)
            .for_each(|b| encode_q4_0(b, &mut out)),
        QuantKind::Q4_1 => values
            .chunks_exact(BLOCK_SIZE)
            .for_each(|b| encode_q4_1(b, &mut out)),
        QuantKind::Q4_K | QuantKind::Q6_K => {
            return Err(InferirError::validation(format!("No encoder for {kind}")));
        },
    }
    Ok(out)
}
