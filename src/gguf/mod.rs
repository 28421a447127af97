//! GGUF (GPT-Generated Unified Format) container support
//!
//! Pure Rust reader, validator and writer for the subset of GGUF this
//! runtime consumes: v2/v3 headers, all metadata value types, and tensors of
//! the kinds in [`QuantKind`](crate::quantize::QuantKind).
//!
//! Format specification: <https://github.com/ggerganov/ggml/blob/master/docs/gguf.md>
//!
//! ## Module Structure
//!
//! - `types`: constants, metadata values, header and tensor directory entries
//! - `io`: little-endian primitives
//! - `reader`: [`GgufFile`] parsing/validation and memory-mapped [`MappedGguf`]
//! - `writer`: [`GgufWriter`]

mod io;
mod reader;
mod types;
mod writer;

pub use reader::{GgufFile, MappedGguf};
pub use types::{
    GgufHeader, MetadataValue, TensorInfo, ALIGNMENT_KEY, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC,
    GGUF_VERSION_V2, GGUF_VERSION_V3,
};
pub use writer::GgufWriter;
