//! Limit operator.

use crate::expr::Expr;
use simile_common::{Result, TransactionId};
use simile_storage::{Operator, RowSource, Tuple, TupleDesc};
use std::sync::Arc;

/// Truncates the child's output after a fixed number of rows.
pub struct LimitOp {
    limit: Expr,
    child: Arc<dyn Operator>,
}

impl LimitOp {
    /// `limit` must be a constant integer expression.
    pub fn new(limit: Expr, child: Arc<dyn Operator>) -> LimitOp {
        LimitOp { limit, child }
    }
}

impl Operator for LimitOp {
    fn descriptor(&self) -> TupleDesc {
        self.child.descriptor()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        let remaining = self.limit.eval_const()?.as_int()?.max(0) as usize;
        let source = self.child.clone().iterator(tid)?;
        Ok(Box::new(LimitSource { source, remaining }))
    }
}

struct LimitSource {
    source: Box<dyn RowSource>,
    remaining: usize,
}

impl RowSource for LimitSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.source.next()
    }
}
