//! GGUF parsing and validation
//!
//! [`GgufFile::parse`] reads the header, metadata and tensor directory and
//! then validates the whole layout before anything is handed to the model
//! loader: every tensor's kind×shape byte size must fit exactly in the space
//! before the next tensor (modulo alignment padding) or the end of file.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Cursor;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;

use super::io::{read_string, read_u32, read_u64, read_value};
use super::types::{
    GgufHeader, MetadataValue, TensorInfo, ALIGNMENT_KEY, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC,
    GGUF_VERSION_V2, GGUF_VERSION_V3,
};
use crate::error::{InferirError, Result};
use crate::quantize::{dequantize, QuantKind};
use crate::tensor::Tensor;

/// No real model has more tensors; larger counts mean a corrupted header
const MAX_TENSOR_COUNT: u64 = 100_000;

/// Upper bound on metadata entries
const MAX_METADATA_COUNT: u64 = 10_000;

/// Tensors have at most this many dimensions
const MAX_DIMS: u32 = 8;

/// Parsed and validated GGUF layout (no tensor data)
#[derive(Debug, Clone)]
pub struct GgufFile {
    /// File header
    pub header: GgufHeader,
    /// Metadata, ordered by key
    pub metadata: BTreeMap<String, MetadataValue>,
    /// Tensor directory in file order
    pub tensors: Vec<TensorInfo>,
    /// Data section alignment
    pub alignment: usize,
    /// Absolute offset of the data section
    pub data_start: usize,
}

fn align_up(n: usize, alignment: usize) -> usize {
    n.div_ceil(alignment) * alignment
}

impl GgufFile {
    /// Parse and validate a GGUF image
    ///
    /// # Errors
    ///
    /// Returns `Format` if:
    /// - magic or version is wrong
    /// - any count, string or array exceeds its bound
    /// - a tensor declares an unknown kind, a bad shape, or a byte range
    ///   that overlaps, truncates or leaves more than one alignment unit of
    ///   trailing data
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let magic = read_u32(&mut cursor)?;
        if magic != GGUF_MAGIC {
            return Err(InferirError::format(format!(
                "Invalid GGUF magic: 0x{magic:08X}, expected 0x{GGUF_MAGIC:08X}"
            )));
        }
        let version = read_u32(&mut cursor)?;
        if version != GGUF_VERSION_V3 && version != GGUF_VERSION_V2 {
            return Err(InferirError::format(format!(
                "Unsupported GGUF version {version} (expected 2 or 3)"
            )));
        }
        let tensor_count = read_u64(&mut cursor)?;
        if tensor_count > MAX_TENSOR_COUNT {
            return Err(InferirError::format(format!(
                "tensor_count {tensor_count} exceeds maximum {MAX_TENSOR_COUNT} (corrupted header?)"
            )));
        }
        let metadata_count = read_u64(&mut cursor)?;
        if metadata_count > MAX_METADATA_COUNT {
            return Err(InferirError::format(format!(
                "metadata_count {metadata_count} exceeds maximum {MAX_METADATA_COUNT} (corrupted header?)"
            )));
        }
        let header = GgufHeader {
            version,
            tensor_count,
            metadata_count,
        };

        let mut metadata = BTreeMap::new();
        for _ in 0..metadata_count {
            let key = read_string(&mut cursor)?;
            let value_type = read_u32(&mut cursor)?;
            let value = read_value(&mut cursor, value_type)?;
            if metadata.insert(key.clone(), value).is_some() {
                return Err(InferirError::format(format!("Duplicate metadata key '{key}'")));
            }
        }

        let alignment = match metadata.get(ALIGNMENT_KEY) {
            None => GGUF_DEFAULT_ALIGNMENT,
            Some(v) => v
                .as_usize()
                .filter(|a| a.is_power_of_two())
                .ok_or_else(|| InferirError::format(format!("Invalid {ALIGNMENT_KEY}: {v}")))?,
        };

        #[allow(clippy::cast_possible_truncation)]
        let mut tensors = Vec::with_capacity(tensor_count as usize);
        let mut seen = HashSet::new();
        for _ in 0..tensor_count {
            let name = read_string(&mut cursor)?;
            let n_dims = read_u32(&mut cursor)?;
            if n_dims == 0 || n_dims > MAX_DIMS {
                return Err(InferirError::format(format!(
                    "Tensor '{name}' has {n_dims} dimensions (1..={MAX_DIMS} allowed)"
                )));
            }
            let mut shape = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                let d = read_u64(&mut cursor)?;
                shape.push(usize::try_from(d).map_err(|_| {
                    InferirError::format(format!("Tensor '{name}' dimension {d} too large"))
                })?);
            }
            // Stored innermost-first; row-major is [out, in]
            shape.reverse();
            let kind = QuantKind::from_tag(read_u32(&mut cursor)?)
                .map_err(|e| InferirError::format(format!("Tensor '{name}': {e}")))?;
            let offset = read_u64(&mut cursor)?;
            if !seen.insert(name.clone()) {
                return Err(InferirError::format(format!("Duplicate tensor '{name}'")));
            }
            tensors.push(TensorInfo {
                name,
                shape,
                kind,
                offset,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let data_start = align_up(cursor.position() as usize, alignment);
        let file = Self {
            header,
            metadata,
            tensors,
            alignment,
            data_start,
        };
        file.validate_layout(data.len())?;
        debug!(
            version,
            tensors = file.tensors.len(),
            metadata = file.metadata.len(),
            "Parsed GGUF container"
        );
        Ok(file)
    }

    /// Check every tensor's byte range against its neighbours and the file end
    fn validate_layout(&self, file_len: usize) -> Result<()> {
        if self.tensors.is_empty() {
            return Ok(());
        }
        if self.data_start > file_len {
            return Err(InferirError::format(format!(
                "Data section starts at {} beyond file size {file_len}",
                self.data_start
            )));
        }
        let data_len = file_len - self.data_start;

        let mut spans = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            let start = usize::try_from(t.offset)
                .map_err(|_| InferirError::format(format!("Tensor '{}' offset too large", t.name)))?;
            if start % self.alignment != 0 {
                return Err(InferirError::format(format!(
                    "Tensor '{}' offset {start} is not {}-byte aligned",
                    t.name, self.alignment
                )));
            }
            let size = t.byte_size()?;
            spans.push((start, size, t.name.as_str()));
        }
        spans.sort_unstable_by_key(|&(start, _, _)| start);

        for (i, &(start, size, name)) in spans.iter().enumerate() {
            let end = start
                .checked_add(size)
                .ok_or_else(|| InferirError::format(format!("Tensor '{name}' range overflows")))?;
            let limit = spans.get(i + 1).map_or(data_len, |&(next, _, _)| next);
            if end > limit {
                return Err(InferirError::format(format!(
                    "Tensor '{name}' needs bytes [{start}, {end}) but only {} are available \
                     (declared size disagrees with shape and kind)",
                    limit.saturating_sub(start)
                )));
            }
            if limit - end >= self.alignment {
                return Err(InferirError::format(format!(
                    "Tensor '{name}' is followed by {} unaccounted bytes \
                     (declared size disagrees with shape and kind)",
                    limit - end
                )));
            }
        }
        Ok(())
    }

    /// Metadata value by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    /// `general.architecture`
    ///
    /// # Errors
    ///
    /// Returns `Format` if the key is missing or not a string
    pub fn architecture(&self) -> Result<&str> {
        self.get("general.architecture")
            .and_then(MetadataValue::as_str)
            .ok_or_else(|| InferirError::format("Missing general.architecture"))
    }

    /// Directory entry by name
    #[must_use]
    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Absolute byte range of a tensor's data
    ///
    /// # Errors
    ///
    /// Returns `Format` if the tensor is absent
    pub fn tensor_range(&self, name: &str) -> Result<(&TensorInfo, Range<usize>)> {
        let info = self
            .tensor(name)
            .ok_or_else(|| InferirError::format(format!("Tensor '{name}' not found")))?;
        #[allow(clippy::cast_possible_truncation)]
        let start = self.data_start + info.offset as usize;
        Ok((info, start..start + info.byte_size()?))
    }
}

/// Backing bytes of a container
#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// A parsed GGUF container together with its bytes
///
/// Files opened from disk are memory-mapped; tensor slices point into the
/// mapping without copying.
#[derive(Debug)]
pub struct MappedGguf {
    /// Parsed layout
    pub file: GgufFile,
    backing: Backing,
}

impl MappedGguf {
    /// Memory-map and parse a file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be opened or mapped and `Format` if
    /// parsing fails
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the mapping is read-only and the runtime never writes to
        // model files while they are loaded.
        let mmap = unsafe { Mmap::map(&file)? };
        let parsed = GgufFile::parse(&mmap)?;
        Ok(Self {
            file: parsed,
            backing: Backing::Mapped(mmap),
        })
    }

    /// Parse an in-memory image
    ///
    /// # Errors
    ///
    /// Returns `Format` if parsing fails
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let parsed = GgufFile::parse(&bytes)?;
        Ok(Self {
            file: parsed,
            backing: Backing::Owned(bytes),
        })
    }

    /// Entire file image
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(m) => m,
            Backing::Owned(v) => v,
        }
    }

    /// Raw stored bytes of a tensor
    ///
    /// # Errors
    ///
    /// Returns `Format` if the tensor is absent
    pub fn tensor_bytes(&self, name: &str) -> Result<(&TensorInfo, &[u8])> {
        let (info, range) = self.file.tensor_range(name)?;
        Ok((info, &self.data()[range]))
    }

    /// Dequantized tensor with its declared shape
    ///
    /// # Errors
    ///
    /// Returns `Format` if the tensor is absent or its data is invalid
    pub fn tensor_f32(&self, name: &str) -> Result<Tensor> {
        let (info, bytes) = self.tensor_bytes(name)?;
        let values = dequantize(info.kind, bytes, info.element_count()?)?;
        Tensor::from_vec(info.shape.clone(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::GgufWriter;
    use crate::quantize::quantize;

    fn sample() -> Vec<u8> {
        GgufWriter::new()
            .architecture("gpt2")
            .add_u32("gpt2.context_length", 16)
            .add_tensor("a", &[2, 32], QuantKind::Q8_0, vec![0u8; 68])
            .expect("test")
            .add_tensor("b", &[3], QuantKind::F32, vec![0u8; 12])
            .expect("test")
            .to_bytes()
            .expect("test")
    }

    #[test]
    fn test_parse_sample() {
        let data = sample();
        let f = GgufFile::parse(&data).expect("test");
        assert_eq!(f.header.version, 3);
        assert_eq!(f.architecture().expect("test"), "gpt2");
        assert_eq!(f.tensors.len(), 2);
        assert_eq!(f.tensor("a").expect("test").shape, vec![2, 32]);
        assert_eq!(f.data_start % 32, 0);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = sample();
        data[0] = b'X';
        assert!(matches!(
            GgufFile::parse(&data),
            Err(InferirError::Format { .. })
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut data = sample();
        data[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert!(GgufFile::parse(&data).is_err());
    }

    #[test]
    fn test_truncated_data_rejected() {
        let mut data = sample();
        data.truncate(data.len() - 4);
        assert!(matches!(
            GgufFile::parse(&data),
            Err(InferirError::Format { .. })
        ));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut data = sample();
        data.extend_from_slice(&[0u8; 64]);
        assert!(GgufFile::parse(&data).is_err());
    }

    #[test]
    fn test_tensor_f32_dequantizes() {
        let values: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        let bytes = GgufWriter::new()
            .add_tensor(
                "w",
                &[2, 32],
                QuantKind::Q8_0,
                quantize(QuantKind::Q8_0, &values).expect("test"),
            )
            .expect("test")
            .to_bytes()
            .expect("test");
        let model = MappedGguf::from_bytes(bytes).expect("test");
        let t = model.tensor_f32("w").expect("test");
        assert_eq!(t.shape(), &[2, 32]);
        assert!((t.data()[63] - values[63]).abs() < 0.01);
        assert!(model.tensor_f32("missing").is_err());
    }

    #[test]
    fn test_open_from_disk() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, sample()).expect("test");
        let model = MappedGguf::open(&path).expect("test");
        assert_eq!(model.file.tensors.len(), 2);
        let (info, bytes) = model.tensor_bytes("b").expect("test");
        assert_eq!(info.kind, QuantKind::F32);
        assert_eq!(bytes.len(), 12);
    }
}
