//! The pull-based row source interface shared by files and operators.

use crate::tuple::{Tuple, TupleDesc};
use simile_common::{Result, TransactionId};
use std::sync::Arc;

/// A resumable sequence of rows with early termination and error
/// propagation. `Ok(None)` is the end-of-stream sentinel; after an error a
/// well-behaved source keeps returning `Ok(None)`.
pub trait RowSource: Send {
    fn next(&mut self) -> Result<Option<Tuple>>;
}

/// Anything that can produce rows under a transaction: heap files, index
/// scans, and every relational operator.
pub trait Operator: Send + Sync {
    /// The descriptor of the rows this operator yields.
    fn descriptor(&self) -> TupleDesc;

    /// Opens a fresh row source over this operator's output.
    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>>;
}

/// Drains a source into a vector. Test and build helper.
pub fn collect_rows(mut source: Box<dyn RowSource>) -> Result<Vec<Tuple>> {
    let mut rows = Vec::new();
    while let Some(t) = source.next()? {
        rows.push(t);
    }
    Ok(rows)
}
