//! Relational operators and the expression sub-language.
//!
//! Every operator presents the same pull-based interface
//! ([`simile_storage::Operator`]): a descriptor for its output rows and an
//! iterator yielding them one at a time under a transaction id.

mod aggregate;
mod dml;
#[cfg(test)]
mod test_util;
mod expr;
mod filter;
mod join;
mod limit;
mod order_by;
mod project;

pub use aggregate::{AggState, Aggregator, AvgAgg, CountAgg, MaxAgg, MinAgg, SumAgg};
pub use dml::{DeleteOp, InsertOp};
pub use expr::{Expr, AILIKE_SCALE};
pub use filter::{eval_pred, BoolOp, Filter};
pub use join::EquiJoin;
pub use limit::LimitOp;
pub use order_by::OrderBy;
pub use project::Project;
