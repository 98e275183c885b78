//! In-memory operators for operator unit tests.

use simile_common::{Result, TransactionId};
use simile_storage::{DataType, FieldDesc, Operator, RowSource, Tuple, TupleDesc, Value};
use std::sync::Arc;

/// An operator yielding a fixed list of rows.
pub struct VecOperator {
    desc: TupleDesc,
    rows: Vec<Tuple>,
}

impl VecOperator {
    pub fn new(desc: TupleDesc, rows: Vec<Tuple>) -> Arc<Self> {
        Arc::new(Self { desc, rows })
    }

    /// One int column named `name`.
    pub fn of_ints(name: &str, values: &[i64]) -> Arc<Self> {
        let desc = TupleDesc::new(vec![FieldDesc::new(name, DataType::Int)]);
        let rows = values
            .iter()
            .map(|&v| Tuple::new(desc.clone(), vec![Value::Int(v)]))
            .collect();
        Self::new(desc, rows)
    }
}

impl Operator for VecOperator {
    fn descriptor(&self) -> TupleDesc {
        self.desc.clone()
    }

    fn iterator(self: Arc<Self>, _tid: TransactionId) -> Result<Box<dyn RowSource>> {
        Ok(Box::new(VecSource {
            rows: self.rows.clone().into(),
        }))
    }
}

struct VecSource {
    rows: std::collections::VecDeque<Tuple>,
}

impl RowSource for VecSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        Ok(self.rows.pop_front())
    }
}
