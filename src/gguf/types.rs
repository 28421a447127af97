//! GGUF type definitions and constants
//!
//! - Magic number and accepted versions
//! - Metadata value model (all 13 GGUF value types)
//! - Header and tensor directory entries

use std::fmt;

use crate::error::{InferirError, Result};
use crate::quantize::QuantKind;
use crate::tensor::element_count;

/// GGUF magic number: "GGUF" in little-endian
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Version written by [`GgufWriter`](super::GgufWriter)
pub const GGUF_VERSION_V3: u32 = 3;

/// Oldest version the reader accepts (same layout with 64-bit counts)
pub const GGUF_VERSION_V2: u32 = 2;

/// Default data section alignment
pub const GGUF_DEFAULT_ALIGNMENT: usize = 32;

/// Metadata key overriding the alignment
pub const ALIGNMENT_KEY: &str = "general.alignment";

/// GGUF metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// Unsigned 8-bit integer
    UInt8(u8),
    /// Signed 8-bit integer
    Int8(i8),
    /// Unsigned 16-bit integer
    UInt16(u16),
    /// Signed 16-bit integer
    Int16(i16),
    /// Unsigned 32-bit integer
    UInt32(u32),
    /// Signed 32-bit integer
    Int32(i32),
    /// 32-bit float
    Float32(f32),
    /// Boolean
    Bool(bool),
    /// UTF-8 string
    String(String),
    /// Homogeneous array
    Array(Vec<MetadataValue>),
    /// Unsigned 64-bit integer
    UInt64(u64),
    /// Signed 64-bit integer
    Int64(i64),
    /// 64-bit float
    Float64(f64),
}

impl MetadataValue {
    /// Wire type tag
    #[must_use]
    pub fn type_tag(&self) -> u32 {
        match self {
            Self::UInt8(_) => 0,
            Self::Int8(_) => 1,
            Self::UInt16(_) => 2,
            Self::Int16(_) => 3,
            Self::UInt32(_) => 4,
            Self::Int32(_) => 5,
            Self::Float32(_) => 6,
            Self::Bool(_) => 7,
            Self::String(_) => 8,
            Self::Array(_) => 9,
            Self::UInt64(_) => 10,
            Self::Int64(_) => 11,
            Self::Float64(_) => 12,
        }
    }

    /// Any non-negative integer value widened to `u64`
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::UInt8(v) => Some(u64::from(v)),
            Self::UInt16(v) => Some(u64::from(v)),
            Self::UInt32(v) => Some(u64::from(v)),
            Self::UInt64(v) => Some(v),
            Self::Int8(v) => u64::try_from(v).ok(),
            Self::Int16(v) => u64::try_from(v).ok(),
            Self::Int32(v) => u64::try_from(v).ok(),
            Self::Int64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Integer value as `usize`
    #[must_use]
    pub fn as_usize(&self) -> Option<usize> {
        self.as_u64().and_then(|v| usize::try_from(v).ok())
    }

    /// Integer value as `u32`
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    /// Float value (either width)
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::Float32(v) => Some(v),
            Self::Float64(v) => Some(v as f32),
            _ => None,
        }
    }

    /// Boolean value
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// String value
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Array elements
    #[must_use]
    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt8(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Array(items) => write!(f, "[{} items]", items.len()),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
        }
    }
}

/// GGUF file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    /// Format version (2 or 3)
    pub version: u32,
    /// Number of tensors in the directory
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_count: u64,
}

/// Tensor directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Tensor name
    pub name: String,
    /// Shape in row-major order (`[out, in]` for a weight matrix); the file
    /// stores dimensions innermost-first and the reader reverses them
    pub shape: Vec<usize>,
    /// Storage kind
    pub kind: QuantKind,
    /// Offset of the data relative to the start of the data section
    pub offset: u64,
}

impl TensorInfo {
    /// Number of elements
    ///
    /// # Errors
    ///
    /// Returns `Format` if the shape is empty, has a zero dimension or
    /// overflows the tensor index space
    pub fn element_count(&self) -> Result<usize> {
        element_count(&self.shape).map_err(|e| {
            InferirError::format(format!("Tensor '{}': {e}", self.name))
        })
    }

    /// Bytes the declared kind and shape occupy
    ///
    /// # Errors
    ///
    /// Returns `Format` if the element count is invalid or not a whole
    /// number of blocks
    pub fn byte_size(&self) -> Result<usize> {
        self.kind
            .byte_size(self.element_count()?)
            .map_err(|e| InferirError::format(format!("Tensor '{}': {e}", self.name)))
    }

    /// Rows and columns of the matrix view (leading dimensions are folded
    /// into rows)
    #[must_use]
    pub fn matrix_dims(&self) -> (usize, usize) {
        let cols = self.shape.last().copied().unwrap_or(1);
        let rows = self.shape[..self.shape.len().saturating_sub(1)]
            .iter()
            .product::<usize>();
        (rows.max(1), cols)
    }
}
