//! GGUF primitive readers and writers
//!
//! Little-endian scalars, length-prefixed strings and typed metadata values.
//! A short read is reported as `Format` naming the field, never as a bare
//! I/O error, so a truncated file is distinguishable from a missing one.

use std::io::{Cursor, Read, Write};

use super::types::MetadataValue;
use crate::error::{InferirError, Result};

/// Longest string the reader will allocate for
const MAX_STRING_LEN: u64 = 1 << 24;

/// Longest metadata array the reader will allocate for
const MAX_ARRAY_LEN: u64 = 10_000_000;

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    cursor.read_exact(&mut buf).map_err(|_| {
        InferirError::format(format!(
            "Truncated file reading {what} at offset {}",
            cursor.position()
        ))
    })?;
    Ok(buf)
}

pub(crate) fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    Ok(read_array::<1>(cursor, "u8")?[0])
}

pub(crate) fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array(cursor, "u16")?))
}

pub(crate) fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(cursor, "u32")?))
}

pub(crate) fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(cursor, "u64")?))
}

/// Read a string: u64 length + UTF-8 bytes
pub(crate) fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u64(cursor)?;
    let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
    if len > MAX_STRING_LEN || len > remaining {
        return Err(InferirError::format(format!(
            "String length {len} at offset {} exceeds file bounds",
            cursor.position()
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let mut bytes = vec![0u8; len as usize];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| InferirError::format("Truncated string data"))?;
    String::from_utf8(bytes).map_err(|e| InferirError::format(format!("Invalid UTF-8: {e}")))
}

/// Read a metadata value of the given wire type
pub(crate) fn read_value(cursor: &mut Cursor<&[u8]>, value_type: u32) -> Result<MetadataValue> {
    Ok(match value_type {
        0 => MetadataValue::UInt8(read_u8(cursor)?),
        1 => MetadataValue::Int8(i8::from_le_bytes(read_array(cursor, "i8")?)),
        2 => MetadataValue::UInt16(read_u16(cursor)?),
        3 => MetadataValue::Int16(i16::from_le_bytes(read_array(cursor, "i16")?)),
        4 => MetadataValue::UInt32(read_u32(cursor)?),
        5 => MetadataValue::Int32(i32::from_le_bytes(read_array(cursor, "i32")?)),
        6 => MetadataValue::Float32(f32::from_le_bytes(read_array(cursor, "f32")?)),
        7 => MetadataValue::Bool(read_u8(cursor)? != 0),
        8 => MetadataValue::String(read_string(cursor)?),
        9 => {
            let element_type = read_u32(cursor)?;
            let len = read_u64(cursor)?;
            if len > MAX_ARRAY_LEN {
                return Err(InferirError::format(format!(
                    "Array length {len} exceeds maximum {MAX_ARRAY_LEN} (corrupted?)"
                )));
            }
            if element_type == 9 {
                return Err(InferirError::format("Nested metadata arrays are not supported"));
            }
            #[allow(clippy::cast_possible_truncation)]
            let mut items = Vec::with_capacity(len.min(4096) as usize);
            for _ in 0..len {
                items.push(read_value(cursor, element_type)?);
            }
            MetadataValue::Array(items)
        },
        10 => MetadataValue::UInt64(read_u64(cursor)?),
        11 => MetadataValue::Int64(i64::from_le_bytes(read_array(cursor, "i64")?)),
        12 => MetadataValue::Float64(f64::from_le_bytes(read_array(cursor, "f64")?)),
        other => {
            return Err(InferirError::format(format!(
                "Unsupported metadata value type {other}"
            )))
        },
    })
}

pub(crate) fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Write a value's payload (the type tag is written by the caller)
pub(crate) fn write_value<W: Write>(w: &mut W, value: &MetadataValue) -> Result<()> {
    match value {
        MetadataValue::UInt8(v) => w.write_all(&[*v])?,
        MetadataValue::Int8(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::UInt16(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::Int16(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::UInt32(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::Int32(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::Float32(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::Bool(v) => w.write_all(&[u8::from(*v)])?,
        MetadataValue::String(s) => write_string(w, s)?,
        MetadataValue::Array(items) => {
            let element_type = items.first().map_or(4, MetadataValue::type_tag);
            if items.iter().any(|i| i.type_tag() != element_type) {
                return Err(InferirError::validation("Metadata arrays must be homogeneous"));
            }
            if element_type == 9 {
                return Err(InferirError::validation("Nested metadata arrays are not supported"));
            }
            w.write_all(&element_type.to_le_bytes())?;
            w.write_all(&(items.len() as u64).to_le_bytes())?;
            for item in items {
                write_value(w, item)?;
            }
        },
        MetadataValue::UInt64(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::Int64(v) => w.write_all(&v.to_le_bytes())?,
        MetadataValue::Float64(v) => w.write_all(&v.to_le_bytes())?,
    }
    Ok(())
}
