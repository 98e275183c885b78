//! CSV bulk loading.
//!
//! Each line becomes its own committed transaction, which bounds the dirty
//! page set in the pool during a large load.

use crate::heap::HeapFile;
use crate::tuple::Tuple;
use crate::value::{DataType, Value};
use simile_common::{Result, SimileError, TransactionId, STRING_LEN, TEXT_CHAR_LEN};
use std::io::BufRead;
use std::sync::Arc;
use tracing::debug;

/// Loads rows from CSV-style text into a heap file.
///
/// - `has_header`: skip the first line.
/// - `sep`: field separator.
/// - `skip_last_field`: drop a trailing separator-induced field (some TPC
///   datasets carry one).
///
/// Integers parse via float then truncate; strings and embedded text are
/// truncated to their fixed widths. Returns the number of rows loaded.
pub fn load_from_csv(
    file: &Arc<HeapFile>,
    reader: impl BufRead,
    has_header: bool,
    sep: char,
    skip_last_field: bool,
) -> Result<usize> {
    let desc = file.desc().clone();
    if desc.fields.is_empty() {
        return Err(SimileError::MalformedData("descriptor has no fields".to_string()));
    }

    let mut loaded = 0;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        // Limit the split so a free-text final column may contain the
        // separator.
        let fields: Vec<&str> = if skip_last_field {
            let mut f: Vec<&str> = line.splitn(desc.fields.len() + 1, sep).collect();
            f.pop();
            f
        } else {
            line.splitn(desc.fields.len(), sep).collect()
        };
        if line_no == 0 && has_header {
            continue;
        }
        if fields.len() != desc.fields.len() {
            return Err(SimileError::MalformedData(format!(
                "line {} has {} fields, expected {}",
                line_no + 1,
                fields.len(),
                desc.fields.len()
            )));
        }

        let mut values = Vec::with_capacity(fields.len());
        for (raw, field) in fields.iter().zip(&desc.fields) {
            let value = match field.dtype {
                DataType::Int => {
                    let trimmed = raw.trim();
                    let parsed: f64 = trimmed.parse().map_err(|_| {
                        SimileError::TypeMismatch {
                            expected: "int".to_string(),
                            actual: format!("'{trimmed}' on line {}", line_no + 1),
                        }
                    })?;
                    Value::Int(parsed as i64)
                }
                DataType::Text => Value::Text(truncate(raw, STRING_LEN)),
                DataType::EmbeddedText => Value::EmbeddedText {
                    text: truncate(raw, TEXT_CHAR_LEN),
                    embedding: vec![],
                },
                DataType::Vector => {
                    return Err(SimileError::IncompatibleTypes(
                        "vector columns cannot be loaded from CSV".to_string(),
                    ))
                }
            };
            values.push(value);
        }

        // One transaction per line keeps the dirty-page set small.
        let tid = TransactionId::new();
        let mut tuple = Tuple::new(desc.clone(), values);
        file.insert_tuple(&mut tuple, tid)?;
        file.pool().commit(tid);
        loaded += 1;
    }
    debug!(file = %file.name(), rows = loaded, "csv load complete");
    Ok(loaded)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::source::{collect_rows, Operator};
    use crate::tuple::{FieldDesc, TupleDesc};
    use simile_buffer::BufferPool;
    use simile_common::EngineConfig;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn make_file(dir: &TempDir, desc: TupleDesc) -> Arc<HeapFile> {
        let config = Arc::new(EngineConfig::for_tests());
        let pool = Arc::new(BufferPool::new(10, config.clone()));
        HeapFile::new(
            dir.path().join("t.dat").to_string_lossy().into_owned(),
            desc,
            pool,
            config,
            Arc::new(HashEmbedder::new(4)),
        )
        .unwrap()
    }

    #[test]
    fn test_load_basic() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![
                FieldDesc::new("name", DataType::Text),
                FieldDesc::new("age", DataType::Int),
            ]),
        );

        let csv = "a,10\nb,20\nc,30\n";
        let n = load_from_csv(&hf, Cursor::new(csv), false, ',', false).unwrap();
        assert_eq!(n, 3);

        let rows = collect_rows(hf.clone().iterator(TransactionId::new()).unwrap()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].values[1], Value::Int(20));
    }

    #[test]
    fn test_load_skips_header() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![FieldDesc::new("age", DataType::Int)]),
        );
        let n = load_from_csv(&hf, Cursor::new("age\n1\n2\n"), true, ',', false).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_load_int_via_float() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![FieldDesc::new("age", DataType::Int)]),
        );
        load_from_csv(&hf, Cursor::new("10.9\n"), false, ',', false).unwrap();
        let rows = collect_rows(hf.clone().iterator(TransactionId::new()).unwrap()).unwrap();
        assert_eq!(rows[0].values[0], Value::Int(10));
    }

    #[test]
    fn test_load_truncates_long_strings() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![FieldDesc::new("name", DataType::Text)]),
        );
        let long = "x".repeat(STRING_LEN * 2);
        load_from_csv(&hf, Cursor::new(long), false, ',', false).unwrap();
        let rows = collect_rows(hf.clone().iterator(TransactionId::new()).unwrap()).unwrap();
        assert_eq!(rows[0].values[0].as_text().unwrap().len(), STRING_LEN);
    }

    #[test]
    fn test_load_embedded_text_generates_embeddings() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![
                FieldDesc::new("id", DataType::Int),
                FieldDesc::new("content", DataType::EmbeddedText),
            ]),
        );
        let n =
            load_from_csv(&hf, Cursor::new("1,hello there\n2,bye now\n"), false, ',', false)
                .unwrap();
        assert_eq!(n, 2);
        let rows = collect_rows(hf.clone().iterator(TransactionId::new()).unwrap()).unwrap();
        assert!(rows[0].values[1].embedding().is_some());
    }

    #[test]
    fn test_load_field_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![
                FieldDesc::new("name", DataType::Text),
                FieldDesc::new("age", DataType::Int),
            ]),
        );
        let result = load_from_csv(&hf, Cursor::new("only-one-field\n"), false, ',', false);
        assert!(matches!(result, Err(SimileError::MalformedData(_))));
    }

    #[test]
    fn test_load_bad_int() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![FieldDesc::new("age", DataType::Int)]),
        );
        let result = load_from_csv(&hf, Cursor::new("not-a-number\n"), false, ',', false);
        assert!(matches!(result, Err(SimileError::TypeMismatch { .. })));
    }

    #[test]
    fn test_last_field_keeps_separators() {
        let dir = TempDir::new().unwrap();
        let hf = make_file(
            &dir,
            TupleDesc::new(vec![
                FieldDesc::new("id", DataType::Int),
                FieldDesc::new("content", DataType::EmbeddedText),
            ]),
        );
        load_from_csv(&hf, Cursor::new("1,hello, with comma\n"), false, ',', false).unwrap();
        let rows = collect_rows(hf.clone().iterator(TransactionId::new()).unwrap()).unwrap();
        match &rows[0].values[1] {
            Value::EmbeddedText { text, .. } => assert_eq!(text, "hello, with comma"),
            other => panic!("unexpected value {other:?}"),
        }
    }
}
