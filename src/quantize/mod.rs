//! Quantization and dequantization for model weights
//!
//! Implements the storage kinds a model container may declare:
//! - `F32`, `F16`: unquantized, one element per "block"
//! - `Q4_0`: 4-bit, f16 scale, block size 32 (`value = (q - 8) * d`)
//! - `Q4_1`: 4-bit, f16 scale and min, block size 32 (`value = q * d + min`)
//! - `Q8_0`: 8-bit, f16 scale, block size 32 (`value = q * d`)
//! - `Q4_K`: 4-bit super-blocks of 256 with packed 6-bit sub-block scales
//!   and mins (`value = d * scale * q - dmin * min`)
//! - `Q6_K`: 6-bit super-blocks of 256 with signed 8-bit sub-block scales
//!   (`value = d * scale * (q - 32)`)
//!
//! [`QuantKind`] is a closed enum; every operation dispatches on it with a
//! single `match`, and unknown container tags are rejected with `Format`.

mod dequant;
mod encode;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use dequant::{dequantize, dequantize_into};
pub use encode::quantize;

use crate::error::{InferirError, Result};

/// Elements per block for the 32-wide kinds
pub const BLOCK_SIZE: usize = 32;

/// Elements per K-quant super-block
pub const QK_K: usize = 256;

/// Storage kind of a tensor
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantKind {
    /// 32-bit float
    F32,
    /// 16-bit IEEE half
    F16,
    /// 4-bit symmetric
    Q4_0,
    /// 4-bit with offset
    Q4_1,
    /// 8-bit symmetric
    Q8_0,
    /// 4-bit K-quant
    Q4_K,
    /// 6-bit K-quant
    Q6_K,
}

impl QuantKind {
    /// All supported kinds
    pub const ALL: [Self; 7] = [
        Self::F32,
        Self::F16,
        Self::Q4_0,
        Self::Q4_1,
        Self::Q8_0,
        Self::Q4_K,
        Self::Q6_K,
    ];

    /// Decode a GGUF tensor type tag
    ///
    /// # Errors
    ///
    /// Returns `Format` for tags this runtime does not implement
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            2 => Ok(Self::Q4_0),
            3 => Ok(Self::Q4_1),
            8 => Ok(Self::Q8_0),
            12 => Ok(Self::Q4_K),
            14 => Ok(Self::Q6_K),
            other => Err(InferirError::format(format!(
                "Unsupported quantization kind tag {other}"
            ))),
        }
    }

    /// GGUF tensor type tag
    #[must_use]
    pub fn tag(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q8_0 => 8,
            Self::Q4_K => 12,
            Self::Q6_K => 14,
        }
    }

    /// Elements per block
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q8_0 => BLOCK_SIZE,
            Self::Q4_K | Self::Q6_K => QK_K,
        }
    }

    /// Bytes per block
    #[must_use]
    pub fn block_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q8_0 => 34,
            Self::Q4_K => 144,
            Self::Q6_K => 210,
        }
    }

    /// Bytes needed to store `elements` values
    ///
    /// # Errors
    ///
    /// Returns `Format` if `elements` is not a whole number of blocks or the
    /// size overflows
    pub fn byte_size(self, elements: usize) -> Result<usize> {
        let bs = self.block_size();
        if elements % bs != 0 {
            return Err(InferirError::format(format!(
                "{elements} elements are not a whole number of {self} blocks of {bs}"
            )));
        }
        (elements / bs)
            .checked_mul(self.block_bytes())
            .ok_or_else(|| InferirError::format(format!("{self} size of {elements} overflows")))
    }

    /// Whether values are stored in packed blocks rather than plain floats
    #[must_use]
    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16)
    }

    /// Whether [`quantize`] can write this kind
    #[must_use]
    pub fn can_encode(self) -> bool {
        !matches!(self, Self::Q4_K | Self::Q6_K)
    }

    /// Lower-case name, as accepted by [`FromStr`]
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q8_0 => "q8_0",
            Self::Q4_K => "q4_k",
            Self::Q6_K => "q6_k",
        }
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_ascii_uppercase())
    }
}

impl FromStr for QuantKind {
    type Err = InferirError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.name() == lower)
            .ok_or_else(|| InferirError::validation(format!("Unknown quantization kind '{s}'")))
    }
}
