//! Typed cell values and their fixed-width on-disk codecs.

use bytes::{Buf, BufMut};
use simile_common::{Result, SimileError, STRING_LEN, TEXT_CHAR_LEN};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// The type of a tuple field.
///
/// All types are fixed width on disk; vector-bearing types derive their
/// width from the engine's embedding dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 64-bit signed integer.
    Int,
    /// String padded to [`STRING_LEN`] bytes.
    Text,
    /// Short text plus its embedding vector.
    EmbeddedText,
    /// Embedding vector only.
    Vector,
}

impl DataType {
    /// On-disk width of a value of this type, given the embedding dimension.
    pub fn byte_size(&self, dim: usize) -> usize {
        match self {
            DataType::Int => 8,
            DataType::Text => STRING_LEN,
            DataType::EmbeddedText => 8 * dim + TEXT_CHAR_LEN,
            DataType::Vector => 8 * dim,
        }
    }

    /// Parses a catalog type name.
    pub fn parse(name: &str) -> Option<DataType> {
        match name {
            "int" | "integer" => Some(DataType::Int),
            "string" | "varchar" | "text" => Some(DataType::Text),
            "embtext" => Some(DataType::EmbeddedText),
            "embvec" => Some(DataType::Vector),
            _ => None,
        }
    }

    /// Canonical catalog name for this type.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Text => "string",
            DataType::EmbeddedText => "embtext",
            DataType::Vector => "embvec",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
    /// Text plus its embedding. The embedding is empty until the row passes
    /// through the heap-file insert path, which fills it in.
    EmbeddedText { text: String, embedding: Vec<f64> },
    Vector(Vec<f64>),
}

impl Value {
    /// The type tag of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Text(_) => DataType::Text,
            Value::EmbeddedText { .. } => DataType::EmbeddedText,
            Value::Vector(_) => DataType::Vector,
        }
    }

    /// The integer payload, or a type-mismatch error.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(mismatch(DataType::Int, other)),
        }
    }

    /// The string payload, or a type-mismatch error.
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Value::Text(v) => Ok(v),
            other => Err(mismatch(DataType::Text, other)),
        }
    }

    /// The embedding carried by this value, if it carries one.
    pub fn embedding(&self) -> Option<&[f64]> {
        match self {
            Value::EmbeddedText { embedding, .. } if !embedding.is_empty() => Some(embedding),
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Serializes this value into `buf` at its fixed width.
    pub fn write_to(&self, buf: &mut impl BufMut, dim: usize) -> Result<()> {
        match self {
            Value::Int(v) => buf.put_i64_le(*v),
            Value::Text(s) => put_padded(buf, s, STRING_LEN),
            Value::EmbeddedText { text, embedding } => {
                put_embedding(buf, embedding, dim)?;
                put_padded(buf, text, TEXT_CHAR_LEN);
            }
            Value::Vector(v) => put_embedding(buf, v, dim)?,
        }
        Ok(())
    }

    /// Deserializes a value of the given type from `buf`.
    pub fn read_from(buf: &mut impl Buf, dtype: DataType, dim: usize) -> Result<Value> {
        if buf.remaining() < dtype.byte_size(dim) {
            return Err(SimileError::MalformedData(format!(
                "buffer too short for {dtype} value"
            )));
        }
        Ok(match dtype {
            DataType::Int => Value::Int(buf.get_i64_le()),
            DataType::Text => Value::Text(get_padded(buf, STRING_LEN)),
            DataType::EmbeddedText => {
                let embedding = get_embedding(buf, dim);
                let text = get_padded(buf, TEXT_CHAR_LEN);
                Value::EmbeddedText { text, embedding }
            }
            DataType::Vector => Value::Vector(get_embedding(buf, dim)),
        })
    }
}

fn mismatch(expected: DataType, actual: &Value) -> SimileError {
    SimileError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.data_type().to_string(),
    }
}

fn put_padded(buf: &mut impl BufMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

fn get_padded(buf: &mut impl Buf, width: usize) -> String {
    let mut raw = vec![0u8; width];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    raw.truncate(end);
    String::from_utf8_lossy(&raw).into_owned()
}

fn put_embedding(buf: &mut impl BufMut, emb: &[f64], dim: usize) -> Result<()> {
    if emb.len() != dim {
        return Err(SimileError::MalformedData(format!(
            "embedding has dimension {}, engine expects {}",
            emb.len(),
            dim
        )));
    }
    for &x in emb {
        buf.put_f64_le(x);
    }
    Ok(())
}

fn get_embedding(buf: &mut impl Buf, dim: usize) -> Vec<f64> {
    (0..dim).map(|_| buf.get_f64_le()).collect()
}

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Squared L2 magnitude of a vector.
pub fn squared_magnitude(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// Compares two values of the same type for ordering.
///
/// Ints and strings compare naturally; embedded text compares by text;
/// vectors compare by squared L2 magnitude (compatibility behavior).
pub fn compare_values(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Ok(x.cmp(y)),
        (Value::EmbeddedText { text: x, .. }, Value::EmbeddedText { text: y, .. }) => Ok(x.cmp(y)),
        (Value::Vector(x), Value::Vector(y)) => {
            let mx = squared_magnitude(x);
            let my = squared_magnitude(y);
            Ok(mx.partial_cmp(&my).unwrap_or(Ordering::Equal))
        }
        _ => Err(SimileError::IncompatibleTypes(format!(
            "cannot compare {} with {}",
            a.data_type(),
            b.data_type()
        ))),
    }
}

/// A stable hash of a value, usable as a map key for DISTINCT, GROUP BY,
/// and join buckets. Floats hash by bit pattern.
pub fn hash_value(v: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hash_value_into(v, &mut hasher);
    hasher.finish()
}

pub(crate) fn hash_value_into(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Int(x) => {
            0u8.hash(hasher);
            x.hash(hasher);
        }
        Value::Text(s) => {
            1u8.hash(hasher);
            s.hash(hasher);
        }
        Value::EmbeddedText { text, .. } => {
            // Embeddings are derived data; two rows with the same text are
            // the same row for grouping purposes.
            2u8.hash(hasher);
            text.hash(hasher);
        }
        Value::Vector(emb) => {
            3u8.hash(hasher);
            for x in emb {
                x.to_bits().hash(hasher);
            }
        }
    }
}
