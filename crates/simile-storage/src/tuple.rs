//! Rows, row descriptors, and record identity.

use crate::value::{hash_value_into, DataType, Value};
use bytes::{Buf, BufMut};
use simile_common::{Result, SimileError, PAGE_SIZE};
use std::hash::Hasher;

/// Describes one field of a row: name, optional table qualifier, type.
///
/// Two field descriptors are equal when their names and types are equal;
/// the qualifier only participates in field resolution preferences.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    pub qualifier: Option<String>,
    pub dtype: DataType,
}

impl FieldDesc {
    /// Creates an unqualified field descriptor.
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            qualifier: None,
            dtype,
        }
    }

    /// Creates a table-qualified field descriptor.
    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            qualifier: Some(qualifier.into()),
            dtype,
        }
    }
}

impl PartialEq for FieldDesc {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.dtype == other.dtype
    }
}

impl Eq for FieldDesc {}

/// An ordered sequence of field descriptors: the "type" of a row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleDesc {
    pub fields: Vec<FieldDesc>,
}

impl TupleDesc {
    pub fn new(fields: Vec<FieldDesc>) -> Self {
        Self { fields }
    }

    /// Concatenates the fields of `other` onto this descriptor.
    pub fn merge(&self, other: &TupleDesc) -> TupleDesc {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        TupleDesc { fields }
    }

    /// Byte size of one serialized row of this descriptor.
    pub fn byte_size(&self, dim: usize) -> usize {
        self.fields.iter().map(|f| f.dtype.byte_size(dim)).sum()
    }

    /// Number of row slots that fit on one page after the 8-byte header.
    pub fn slots_per_page(&self, dim: usize) -> Result<usize> {
        let row = self.byte_size(dim);
        if row == 0 {
            return Err(SimileError::MalformedData(
                "descriptor has no fields".to_string(),
            ));
        }
        let slots = (PAGE_SIZE - 8) / row;
        if slots == 0 {
            return Err(SimileError::MalformedData(format!(
                "row of {row} bytes does not fit on a page"
            )));
        }
        Ok(slots)
    }

    /// Finds the best match for `target` among the fields.
    ///
    /// A match has the same name and type; when `target` carries a
    /// qualifier, a field with the same qualifier is preferred. An
    /// unqualified target matching several fields is ambiguous.
    pub fn find_field(&self, target: &FieldDesc) -> Result<usize> {
        let mut best: Option<usize> = None;
        for (i, f) in self.fields.iter().enumerate() {
            if f.name != target.name || f.dtype != target.dtype {
                continue;
            }
            if target.qualifier.is_none() && best.is_some() {
                return Err(SimileError::AmbiguousName(target.name.clone()));
            }
            if f.qualifier == target.qualifier || best.is_none() {
                best = Some(i);
            }
        }
        best.ok_or_else(|| {
            SimileError::IncompatibleTypes(format!(
                "field {}{} not found",
                target
                    .qualifier
                    .as_deref()
                    .map(|q| format!("{q}."))
                    .unwrap_or_default(),
                target.name
            ))
        })
    }

    /// Like [`find_field`], but falls back to ignoring all qualifiers when
    /// no qualified match exists.
    pub fn resolve_field(&self, target: &FieldDesc) -> Result<usize> {
        match self.find_field(target) {
            Ok(i) => Ok(i),
            Err(SimileError::IncompatibleTypes(_)) => {
                let unqualified = TupleDesc {
                    fields: self
                        .fields
                        .iter()
                        .map(|f| FieldDesc {
                            name: f.name.clone(),
                            qualifier: None,
                            dtype: f.dtype,
                        })
                        .collect(),
                };
                unqualified.find_field(target)
            }
            Err(e) => Err(e),
        }
    }
}

/// Opaque identity of a row within a specific storage layer.
///
/// One variant per storage kind; operators that do not interpret identity
/// pass it through untouched. Unstable across deletes (slots are reused)
/// and across page flushes (pages compact on serialization).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordId {
    Heap {
        file: String,
        page_no: usize,
        slot_no: usize,
    },
}

/// A row: values conforming to a descriptor, plus the record identity it
/// was read from storage with (`None` for synthetic rows).
#[derive(Debug, Clone)]
pub struct Tuple {
    pub desc: TupleDesc,
    pub values: Vec<Value>,
    pub rid: Option<RecordId>,
}

impl Tuple {
    /// Creates a synthetic row (no record identity).
    pub fn new(desc: TupleDesc, values: Vec<Value>) -> Self {
        Self {
            desc,
            values,
            rid: None,
        }
    }

    /// Row equality: equal descriptors and equal corresponding values.
    /// Embedded-text fields compare by text (embeddings are derived);
    /// vector fields compare elementwise. Record identity is ignored.
    pub fn equals(&self, other: &Tuple) -> bool {
        if self.desc != other.desc || self.values.len() != other.values.len() {
            return false;
        }
        self.values.iter().zip(&other.values).all(|(a, b)| match (a, b) {
            (
                Value::EmbeddedText { text: ta, .. },
                Value::EmbeddedText { text: tb, .. },
            ) => ta == tb,
            _ => a == b,
        })
    }

    /// Serializes the row field by field at fixed width.
    pub fn write_to(&self, buf: &mut impl BufMut, dim: usize) -> Result<()> {
        if self.values.len() != self.desc.fields.len() {
            return Err(SimileError::MalformedData(
                "tuple value count does not match its descriptor".to_string(),
            ));
        }
        for (value, field) in self.values.iter().zip(&self.desc.fields) {
            if value.data_type() != field.dtype {
                return Err(SimileError::TypeMismatch {
                    expected: field.dtype.to_string(),
                    actual: value.data_type().to_string(),
                });
            }
            value.write_to(buf, dim)?;
        }
        Ok(())
    }

    /// Deserializes a row of the given descriptor.
    pub fn read_from(buf: &mut impl Buf, desc: &TupleDesc, dim: usize) -> Result<Tuple> {
        let values = desc
            .fields
            .iter()
            .map(|f| Value::read_from(buf, f.dtype, dim))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tuple::new(desc.clone(), values))
    }

    /// Produces a new row holding the fields named in `fields`, resolved
    /// against this row's descriptor (qualifier preferred, then ignored).
    pub fn project(&self, fields: &[FieldDesc]) -> Result<Tuple> {
        let values = fields
            .iter()
            .map(|f| {
                let i = self.desc.resolve_field(f)?;
                Ok(self.values[i].clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tuple::new(TupleDesc::new(fields.to_vec()), values))
    }

    /// A stable hash of the row's values, usable as a map key.
    pub fn row_key(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for v in &self.values {
            hash_value_into(v, &mut hasher);
        }
        hasher.finish()
    }
}

/// Concatenates two rows; the result carries no record identity.
pub fn join_tuples(left: &Tuple, right: &Tuple) -> Tuple {
    let mut values = left.values.clone();
    values.extend(right.values.iter().cloned());
    Tuple::new(left.desc.merge(&right.desc), values)
}
