//! Block hash equality join.

use crate::expr::Expr;
use simile_common::{Result, SimileError, TransactionId};
use simile_storage::{
    hash_value, join_tuples, DataType, Operator, RowSource, Tuple, TupleDesc, Value,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Equality join evaluated as a block hash join.
///
/// Up to `max_buffer` left rows are hashed per block; the right side is
/// streamed against the block and rewound for the next one, so
/// intermediate state never exceeds the buffer bound.
pub struct EquiJoin {
    left: Arc<dyn Operator>,
    right: Arc<dyn Operator>,
    left_expr: Expr,
    right_expr: Expr,
    max_buffer: usize,
}

impl EquiJoin {
    pub fn new(
        left: Arc<dyn Operator>,
        left_expr: Expr,
        right: Arc<dyn Operator>,
        right_expr: Expr,
        max_buffer: usize,
    ) -> Result<EquiJoin> {
        let lt = left_expr.expr_type()?.dtype;
        let rt = right_expr.expr_type()?.dtype;
        if lt != rt {
            return Err(SimileError::TypeMismatch {
                expected: lt.to_string(),
                actual: rt.to_string(),
            });
        }
        if !matches!(lt, DataType::Int | DataType::Text) {
            return Err(SimileError::IncompatibleTypes(
                "join keys must be ints or strings".to_string(),
            ));
        }
        if max_buffer == 0 {
            return Err(SimileError::IllegalOperation(
                "join buffer must hold at least one row".to_string(),
            ));
        }
        Ok(EquiJoin {
            left,
            right,
            left_expr,
            right_expr,
            max_buffer,
        })
    }
}

impl Operator for EquiJoin {
    fn descriptor(&self) -> TupleDesc {
        self.left.descriptor().merge(&self.right.descriptor())
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        let left_source = self.left.clone().iterator(tid)?;
        Ok(Box::new(JoinSource {
            join: self,
            tid,
            left_source,
            left_done: false,
            block: HashMap::new(),
            right_source: None,
            pending: VecDeque::new(),
        }))
    }
}

struct JoinSource {
    join: Arc<EquiJoin>,
    tid: TransactionId,
    left_source: Box<dyn RowSource>,
    left_done: bool,
    /// Current block of left rows, bucketed by join-key hash.
    block: HashMap<u64, Vec<(Value, Tuple)>>,
    /// Right-side stream for the current block; reopened per block.
    right_source: Option<Box<dyn RowSource>>,
    pending: VecDeque<Tuple>,
}

impl JoinSource {
    fn fill_block(&mut self) -> Result<()> {
        self.block.clear();
        let mut buffered = 0;
        while buffered < self.join.max_buffer {
            let Some(t) = self.left_source.next()? else {
                self.left_done = true;
                break;
            };
            let key = self.join.left_expr.eval(&t)?;
            self.block
                .entry(hash_value(&key))
                .or_default()
                .push((key, t));
            buffered += 1;
        }
        Ok(())
    }
}

impl RowSource for JoinSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some(t) = self.pending.pop_front() {
                return Ok(Some(t));
            }

            if self.block.is_empty() {
                if self.left_done {
                    return Ok(None);
                }
                self.fill_block()?;
                if self.block.is_empty() {
                    return Ok(None);
                }
                // Rewind the right side for the new block.
                self.right_source = Some(self.join.right.clone().iterator(self.tid)?);
            }

            let right_source = self
                .right_source
                .as_mut()
                .ok_or_else(|| SimileError::IllegalOperation("join right side missing".into()))?;
            match right_source.next()? {
                Some(rt) => {
                    let right_key = self.join.right_expr.eval(&rt)?;
                    if let Some(bucket) = self.block.get(&hash_value(&right_key)) {
                        for (left_key, lt) in bucket {
                            if *left_key == right_key {
                                self.pending.push_back(join_tuples(lt, &rt));
                            }
                        }
                    }
                }
                None => {
                    // Block exhausted against the whole right side.
                    self.block.clear();
                }
            }
        }
    }
}
