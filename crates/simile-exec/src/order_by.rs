//! Blocking in-memory sort.

use crate::expr::Expr;
use simile_common::{Result, SimileError, TransactionId};
use simile_storage::{compare_values, Operator, RowSource, Tuple, TupleDesc, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// Materializes the child's rows, sorts them by a list of
/// `(expression, ascending)` keys, and yields them in order.
///
/// Ints and strings compare naturally; vectors compare by L2 magnitude.
pub struct OrderBy {
    order_by: Vec<Expr>,
    ascending: Vec<bool>,
    child: Arc<dyn Operator>,
}

impl OrderBy {
    pub fn new(order_by: Vec<Expr>, ascending: Vec<bool>, child: Arc<dyn Operator>) -> Result<OrderBy> {
        if order_by.len() != ascending.len() {
            return Err(SimileError::MalformedData(
                "order-by expressions and directions differ in length".to_string(),
            ));
        }
        Ok(OrderBy {
            order_by,
            ascending,
            child,
        })
    }
}

impl Operator for OrderBy {
    fn descriptor(&self) -> TupleDesc {
        self.child.descriptor()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        Ok(Box::new(OrderBySource {
            order_by: self,
            tid,
            sorted: None,
        }))
    }
}

struct OrderBySource {
    order_by: Arc<OrderBy>,
    tid: TransactionId,
    /// Sorted output in reverse, populated on first pull; rows pop off the
    /// back.
    sorted: Option<Vec<Tuple>>,
}

impl OrderBySource {
    fn sort_input(&mut self) -> Result<Vec<Tuple>> {
        let mut source = self.order_by.child.clone().iterator(self.tid)?;
        // Evaluate the sort keys up front so evaluation errors surface
        // here rather than inside the comparator.
        let mut keyed: Vec<(Vec<Value>, Tuple)> = Vec::new();
        while let Some(t) = source.next()? {
            let keys = self
                .order_by
                .order_by
                .iter()
                .map(|e| e.eval(&t))
                .collect::<Result<Vec<_>>>()?;
            keyed.push((keys, t));
        }

        let ascending = &self.order_by.ascending;
        keyed.sort_by(|(a, _), (b, _)| {
            for ((ka, kb), &asc) in a.iter().zip(b).zip(ascending) {
                let ord = compare_values(ka, kb).unwrap_or(Ordering::Equal);
                let ord = if asc { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let mut rows: Vec<Tuple> = keyed.into_iter().map(|(_, t)| t).collect();
        rows.reverse();
        Ok(rows)
    }
}

impl RowSource for OrderBySource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.sorted.is_none() {
            let rows = self.sort_input()?;
            self.sorted = Some(rows);
        }
        Ok(self.sorted.as_mut().and_then(|rows| rows.pop()))
    }
}
