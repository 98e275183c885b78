//! Insert and delete sinks.
//!
//! Both drain their child and emit a single `(count)` row reporting how
//! many rows were written or removed.

use simile_common::{Result, SimileError, TransactionId};
use simile_storage::{DataType, FieldDesc, HeapFile, Operator, RowSource, Tuple, TupleDesc, Value};
use std::sync::Arc;

fn count_desc() -> TupleDesc {
    TupleDesc::new(vec![FieldDesc::new("count", DataType::Int)])
}

fn check_desc(child: &TupleDesc, file: &TupleDesc, action: &str) -> Result<()> {
    if child != file {
        return Err(SimileError::TypeMismatch {
            expected: format!("{} rows matching the table descriptor", action),
            actual: "child rows with a different descriptor".to_string(),
        });
    }
    Ok(())
}

/// Inserts the child's rows into a table file.
pub struct InsertOp {
    file: Arc<HeapFile>,
    child: Arc<dyn Operator>,
}

impl InsertOp {
    pub fn new(file: Arc<HeapFile>, child: Arc<dyn Operator>) -> InsertOp {
        InsertOp { file, child }
    }
}

impl Operator for InsertOp {
    fn descriptor(&self) -> TupleDesc {
        count_desc()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        check_desc(&self.child.descriptor(), self.file.desc(), "insert")?;
        let source = self.child.clone().iterator(tid)?;
        Ok(Box::new(InsertSource {
            op: self,
            tid,
            source,
            done: false,
        }))
    }
}

struct InsertSource {
    op: Arc<InsertOp>,
    tid: TransactionId,
    source: Box<dyn RowSource>,
    done: bool,
}

impl RowSource for InsertSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.done {
            return Ok(None);
        }
        let mut count: i64 = 0;
        while let Some(mut t) = self.source.next()? {
            self.op.file.insert_tuple(&mut t, self.tid)?;
            count += 1;
        }
        self.done = true;
        Ok(Some(Tuple::new(count_desc(), vec![Value::Int(count)])))
    }
}

/// Deletes the child's rows (located by record identity) from a table file.
pub struct DeleteOp {
    file: Arc<HeapFile>,
    child: Arc<dyn Operator>,
}

impl DeleteOp {
    pub fn new(file: Arc<HeapFile>, child: Arc<dyn Operator>) -> DeleteOp {
        DeleteOp { file, child }
    }
}

impl Operator for DeleteOp {
    fn descriptor(&self) -> TupleDesc {
        count_desc()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        check_desc(&self.child.descriptor(), self.file.desc(), "delete")?;
        let source = self.child.clone().iterator(tid)?;
        Ok(Box::new(DeleteSource {
            op: self,
            tid,
            source,
            done: false,
        }))
    }
}

struct DeleteSource {
    op: Arc<DeleteOp>,
    tid: TransactionId,
    source: Box<dyn RowSource>,
    done: bool,
}

impl RowSource for DeleteSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.done {
            return Ok(None);
        }
        let mut count: i64 = 0;
        while let Some(t) = self.source.next()? {
            self.op.file.delete_tuple(&t, self.tid)?;
            count += 1;
        }
        self.done = true;
        Ok(Some(Tuple::new(count_desc(), vec![Value::Int(count)])))
    }
}
