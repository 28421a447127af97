//! GGUF writer
//!
//! Builds valid v3 containers: used by the `quantize` command, by test
//! fixtures and by anything that needs to hand a model to the loader.
//!
//! ```
//! use inferir::gguf::{GgufFile, GgufWriter};
//! use inferir::quantize::QuantKind;
//!
//! let bytes = GgufWriter::new()
//!     .architecture("gpt2")
//!     .add_u32("gpt2.context_length", 64)
//!     .add_tensor("output_norm.weight", &[4], QuantKind::F32, vec![0u8; 16])
//!     .unwrap()
//!     .to_bytes()
//!     .unwrap();
//! let file = GgufFile::parse(&bytes).unwrap();
//! assert_eq!(file.tensors.len(), 1);
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::io::{write_string, write_value};
use super::types::{
    MetadataValue, ALIGNMENT_KEY, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V3,
};
use crate::error::{InferirError, Result};
use super::reader::MappedGguf;
use crate::quantize::{dequantize, quantize, QuantKind};
use crate::tensor::{element_count, Tensor};

#[derive(Debug, Clone)]
struct PendingTensor {
    name: String,
    shape: Vec<usize>,
    kind: QuantKind,
    bytes: Vec<u8>,
}

/// Builder for GGUF v3 files
#[derive(Debug, Clone, Default)]
pub struct GgufWriter {
    metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<PendingTensor>,
}

impl GgufWriter {
    /// Empty container
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a metadata entry
    #[must_use]
    pub fn add_metadata(mut self, key: &str, value: MetadataValue) -> Self {
        if let Some(slot) = self.metadata.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.metadata.push((key.to_string(), value));
        }
        self
    }

    /// Add a `u32` metadata entry
    #[must_use]
    pub fn add_u32(self, key: &str, value: u32) -> Self {
        self.add_metadata(key, MetadataValue::UInt32(value))
    }

    /// Add an `f32` metadata entry
    #[must_use]
    pub fn add_f32(self, key: &str, value: f32) -> Self {
        self.add_metadata(key, MetadataValue::Float32(value))
    }

    /// Add a boolean metadata entry
    #[must_use]
    pub fn add_bool(self, key: &str, value: bool) -> Self {
        self.add_metadata(key, MetadataValue::Bool(value))
    }

    /// Add a string metadata entry
    #[must_use]
    pub fn add_string(self, key: &str, value: &str) -> Self {
        self.add_metadata(key, MetadataValue::String(value.to_string()))
    }

    /// Set `general.architecture`
    #[must_use]
    pub fn architecture(self, arch: &str) -> Self {
        self.add_string("general.architecture", arch)
    }

    /// Copy every metadata entry from a parsed container
    #[must_use]
    pub fn with_metadata_from<'a>(
        mut self,
        entries: impl IntoIterator<Item = (&'a String, &'a MetadataValue)>,
    ) -> Self {
        for (k, v) in entries {
            self = self.add_metadata(k, v.clone());
        }
        self
    }

    /// Add a tensor from already-encoded bytes
    ///
    /// `shape` is row-major; the writer stores it innermost-first.
    ///
    /// # Errors
    ///
    /// Returns `Format` if the byte length disagrees with `shape` and `kind`,
    /// and `Validation` for a duplicate name
    pub fn add_tensor(
        mut self,
        name: &str,
        shape: &[usize],
        kind: QuantKind,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let n = element_count(shape)?;
        let expected = kind.byte_size(n)?;
        if bytes.len() != expected {
            return Err(InferirError::format(format!(
                "Tensor '{name}' {kind} {shape:?} needs {expected} bytes, got {}",
                bytes.len()
            )));
        }
        if self.tensors.iter().any(|t| t.name == name) {
            return Err(InferirError::validation(format!("Duplicate tensor '{name}'")));
        }
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            shape: shape.to_vec(),
            kind,
            bytes,
        });
        Ok(self)
    }

    /// Encode a float tensor as `kind` and add it
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `kind` has no encoder or the tensor is not a
    /// whole number of blocks
    pub fn add_f32_tensor(self, name: &str, tensor: &Tensor, kind: QuantKind) -> Result<Self> {
        let bytes = quantize(kind, tensor.data())?;
        self.add_tensor(name, tensor.shape(), kind, bytes)
    }

    fn alignment(&self) -> usize {
        self.metadata
            .iter()
            .find(|(k, _)| k == ALIGNMENT_KEY)
            .and_then(|(_, v)| v.as_usize())
            .filter(|a| a.is_power_of_two())
            .unwrap_or(GGUF_DEFAULT_ALIGNMENT)
    }

    /// Serialize into `w`
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure and `Validation` for unencodable
    /// metadata
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let alignment = self.alignment();
        let pad = |pos: usize| pos.div_ceil(alignment) * alignment - pos;

        // Header, metadata and directory are staged so the data section
        // start is known before padding
        let mut head = Vec::new();
        head.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        head.extend_from_slice(&GGUF_VERSION_V3.to_le_bytes());
        head.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        head.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());
        for (key, value) in &self.metadata {
            write_string(&mut head, key)?;
            head.extend_from_slice(&value.type_tag().to_le_bytes());
            write_value(&mut head, value)?;
        }

        let mut offset = 0usize;
        for t in &self.tensors {
            write_string(&mut head, &t.name)?;
            let n_dims = u32::try_from(t.shape.len())
                .map_err(|_| InferirError::validation(format!("Tensor '{}' has too many dims", t.name)))?;
            head.extend_from_slice(&n_dims.to_le_bytes());
            for &d in t.shape.iter().rev() {
                head.extend_from_slice(&(d as u64).to_le_bytes());
            }
            head.extend_from_slice(&t.kind.tag().to_le_bytes());
            head.extend_from_slice(&(offset as u64).to_le_bytes());
            offset += t.bytes.len();
            offset += pad(offset);
        }

        let zeros = vec![0u8; alignment];
        w.write_all(&head)?;
        w.write_all(&zeros[..pad(head.len())])?;
        let mut written = 0usize;
        for t in &self.tensors {
            w.write_all(&zeros[..pad(written)])?;
            written += pad(written);
            w.write_all(&t.bytes)?;
            written += t.bytes.len();
        }
        w.flush()?;
        Ok(())
    }

    /// Serialize into a byte vector
    ///
    /// # Errors
    ///
    /// See [`GgufWriter::write_to`]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Serialize into a file
    ///
    /// # Errors
    ///
    /// See [`GgufWriter::write_to`]
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)
    }

    /// Re-encode a container's weight matrices as `kind`
    ///
    /// Metadata is copied. Tensors named `*.weight` with two dimensions and
    /// a whole number of `kind` blocks per row are dequantized and
    /// re-encoded; everything else is copied byte for byte.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `kind` has no encoder and `Format` if a
    /// source tensor fails to decode
    pub fn requantize(container: &MappedGguf, kind: QuantKind) -> Result<Self> {
        if !kind.can_encode() {
            return Err(InferirError::validation(format!("No encoder for {kind}")));
        }
        let mut writer = Self::new().with_metadata_from(&container.file.metadata);
        for info in &container.file.tensors {
            let (_, bytes) = container.tensor_bytes(&info.name)?;
            let convert = info.name.ends_with(".weight")
                && info.shape.len() == 2
                && info.shape[1] % kind.block_size() == 0
                && info.kind != kind;
            writer = if convert {
                let values = dequantize(info.kind, bytes, info.element_count()?)?;
                let bytes = quantize(kind, &values)?;
                writer.add_tensor(&info.name, &info.shape, kind, bytes)?
            } else {
                writer.add_tensor(&info.name, &info.shape, info.kind, bytes.to_vec())?
            };
        }
        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::GgufFile;

    #[test]
    fn test_offsets_are_aligned() {
        let bytes = GgufWriter::new()
            .add_tensor("a", &[3], QuantKind::F32, vec![1u8; 12])
            .expect("test")
            .add_tensor("b", &[5], QuantKind::F32, vec![2u8; 20])
            .expect("test")
            .to_bytes()
            .expect("test");
        let f = GgufFile::parse(&bytes).expect("test");
        assert_eq!(f.tensor("a").expect("test").offset, 0);
        assert_eq!(f.tensor("b").expect("test").offset, 32);
        let b_start = f.data_start + 32;
        assert_eq!(&bytes[b_start..b_start + 20], &[2u8; 20]);
    }

    #[test]
    fn test_custom_alignment() {
        let bytes = GgufWriter::new()
            .add_u32(ALIGNMENT_KEY, 64)
            .add_tensor("a", &[3], QuantKind::F32, vec![0u8; 12])
            .expect("test")
            .add_tensor("b", &[1], QuantKind::F32, vec![0u8; 4])
            .expect("test")
            .to_bytes()
            .expect("test");
        let f = GgufFile::parse(&bytes).expect("test");
        assert_eq!(f.alignment, 64);
        assert_eq!(f.data_start % 64, 0);
        assert_eq!(f.tensor("b").expect("test").offset, 64);
    }

    #[test]
    fn test_rejects_wrong_byte_length() {
        let result = GgufWriter::new().add_tensor("a", &[32], QuantKind::Q8_0, vec![0u8; 33]);
        assert!(matches!(result, Err(InferirError::Format { .. })));
    }

    #[test]
    fn test_rejects_duplicate_tensor() {
        let result = GgufWriter::new()
            .add_tensor("a", &[1], QuantKind::F32, vec![0u8; 4])
            .expect("test")
            .add_tensor("a", &[1], QuantKind::F32, vec![0u8; 4]);
        assert!(result.is_err());
    }

    #[test]
    fn test_metadata_replaced_not_duplicated() {
        let bytes = GgufWriter::new()
            .add_u32("k", 1)
            .add_u32("k", 2)
            .to_bytes()
            .expect("test");
        let f = GgufFile::parse(&bytes).expect("test");
        assert_eq!(f.get("k").and_then(MetadataValue::as_u32), Some(2));
    }

    #[test]
    fn test_requantize_converts_matrices_only() {
        let values: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) / 16.0).collect();
        let matrix = Tensor::from_vec(vec![2, 32], values).expect("test");
        let norm = Tensor::from_vec(vec![32], vec![1.0; 32]).expect("test");
        let bytes = GgufWriter::new()
            .architecture("llama")
            .add_f32_tensor("blk.0.ffn_up.weight", &matrix, QuantKind::F32)
            .expect("test")
            .add_f32_tensor("blk.0.ffn_norm.weight", &norm, QuantKind::F32)
            .expect("test")
            .to_bytes()
            .expect("test");
        let container = MappedGguf::from_bytes(bytes).expect("test");
        let out = GgufWriter::requantize(&container, QuantKind::Q8_0)
            .expect("test")
            .to_bytes()
            .expect("test");
        let f = GgufFile::parse(&out).expect("test");
        assert_eq!(f.tensor("blk.0.ffn_up.weight").expect("test").kind, QuantKind::Q8_0);
        assert_eq!(f.tensor("blk.0.ffn_norm.weight").expect("test").kind, QuantKind::F32);
        assert_eq!(f.architecture().expect("test"), "llama");
    }
}
