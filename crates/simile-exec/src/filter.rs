//! Filter operator and typed predicate evaluation.

use crate::expr::Expr;
use simile_common::{Result, SimileError, TransactionId};
use simile_storage::{DataType, Operator, RowSource, Tuple, TupleDesc, Value};
use std::sync::Arc;

/// Comparison operators usable in filter predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Neq,
    Like,
}

impl BoolOp {
    /// Parses the SQL spelling of an operator.
    pub fn parse(s: &str) -> Option<BoolOp> {
        match s {
            ">" => Some(BoolOp::Gt),
            "<" => Some(BoolOp::Lt),
            ">=" => Some(BoolOp::Ge),
            "<=" => Some(BoolOp::Le),
            "=" => Some(BoolOp::Eq),
            "<>" | "!=" => Some(BoolOp::Neq),
            "like" => Some(BoolOp::Like),
            _ => None,
        }
    }
}

/// Evaluates `left op right` for two values of the same scalar type.
///
/// LIKE applies to strings only: `%` becomes a non-greedy wildcard and the
/// pattern is anchored at both ends.
pub fn eval_pred(left: &Value, right: &Value, op: BoolOp) -> Result<bool> {
    if op == BoolOp::Like {
        let (s, pattern) = (left.as_text()?, right.as_text()?);
        let regex_src = format!("^{}$", pattern.replace('%', ".*?"));
        let re = regex::Regex::new(&regex_src)
            .map_err(|e| SimileError::IllegalOperation(format!("bad LIKE pattern: {e}")))?;
        return Ok(re.is_match(s));
    }

    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        _ => {
            return Err(SimileError::IncompatibleTypes(format!(
                "cannot compare {} with {}",
                left.data_type(),
                right.data_type()
            )))
        }
    };
    Ok(match op {
        BoolOp::Gt => ordering.is_gt(),
        BoolOp::Lt => ordering.is_lt(),
        BoolOp::Ge => ordering.is_ge(),
        BoolOp::Le => ordering.is_le(),
        BoolOp::Eq => ordering.is_eq(),
        BoolOp::Neq => ordering.is_ne(),
        BoolOp::Like => unreachable!(),
    })
}

/// Yields the child rows satisfying `left op right`.
pub struct Filter {
    op: BoolOp,
    left: Expr,
    right: Expr,
    child: Arc<dyn Operator>,
}

impl Filter {
    /// Builds a filter, checking that both sides have the same, comparable
    /// type (ints or strings; LIKE requires strings).
    pub fn new(left: Expr, op: BoolOp, right: Expr, child: Arc<dyn Operator>) -> Result<Filter> {
        let lt = left.expr_type()?.dtype;
        let rt = right.expr_type()?.dtype;
        if lt != rt {
            return Err(SimileError::IncompatibleTypes(
                "filter operands have different types".to_string(),
            ));
        }
        match (op, lt) {
            (BoolOp::Like, DataType::Text) => {}
            (BoolOp::Like, _) => {
                return Err(SimileError::IncompatibleTypes(
                    "LIKE applies to string operands".to_string(),
                ))
            }
            (_, DataType::Int | DataType::Text) => {}
            _ => {
                return Err(SimileError::IncompatibleTypes(
                    "filter operands must be ints or strings".to_string(),
                ))
            }
        }
        Ok(Filter {
            op,
            left,
            right,
            child,
        })
    }
}

impl Operator for Filter {
    fn descriptor(&self) -> TupleDesc {
        self.child.descriptor()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        let source = self.child.clone().iterator(tid)?;
        Ok(Box::new(FilterSource {
            filter: self,
            source,
        }))
    }
}

struct FilterSource {
    filter: Arc<Filter>,
    source: Box<dyn RowSource>,
}

impl RowSource for FilterSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        while let Some(t) = self.source.next()? {
            let left = self.filter.left.eval(&t)?;
            let right = self.filter.right.eval(&t)?;
            if eval_pred(&left, &right, self.filter.op)? {
                return Ok(Some(t));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::VecOperator;
    use simile_storage::{collect_rows, FieldDesc};

    fn ints(values: &[i64]) -> Arc<dyn Operator> {
        VecOperator::of_ints("n", values)
    }

    #[test]
    fn test_parse_ops() {
        assert_eq!(BoolOp::parse(">"), Some(BoolOp::Gt));
        assert_eq!(BoolOp::parse("<>"), Some(BoolOp::Neq));
        assert_eq!(BoolOp::parse("!="), Some(BoolOp::Neq));
        assert_eq!(BoolOp::parse("like"), Some(BoolOp::Like));
        assert_eq!(BoolOp::parse("~"), None);
    }

    #[test]
    fn test_eval_pred_ints() {
        assert!(eval_pred(&Value::Int(1), &Value::Int(2), BoolOp::Lt).unwrap());
        assert!(eval_pred(&Value::Int(2), &Value::Int(2), BoolOp::Ge).unwrap());
        assert!(!eval_pred(&Value::Int(1), &Value::Int(2), BoolOp::Eq).unwrap());
    }

    #[test]
    fn test_eval_pred_like() {
        let s = Value::Text("hello world".into());
        assert!(eval_pred(&s, &Value::Text("hello%".into()), BoolOp::Like).unwrap());
        assert!(eval_pred(&s, &Value::Text("%world".into()), BoolOp::Like).unwrap());
        assert!(eval_pred(&s, &Value::Text("%lo wo%".into()), BoolOp::Like).unwrap());
        assert!(!eval_pred(&s, &Value::Text("world%".into()), BoolOp::Like).unwrap());
        // The pattern is anchored: no implicit wildcards.
        assert!(!eval_pred(&s, &Value::Text("hello".into()), BoolOp::Like).unwrap());
    }

    #[test]
    fn test_eval_pred_like_passes_pattern_through() {
        // The pattern is handed to the regex engine as-is after the `%`
        // substitution, so other metacharacters keep their regex meaning.
        let pattern = Value::Text("a.c".into());
        assert!(eval_pred(&Value::Text("a.c".into()), &pattern, BoolOp::Like).unwrap());
        assert!(eval_pred(&Value::Text("abc".into()), &pattern, BoolOp::Like).unwrap());
        assert!(!eval_pred(&Value::Text("ac".into()), &pattern, BoolOp::Like).unwrap());
    }

    #[test]
    fn test_eval_pred_mixed_types() {
        assert!(eval_pred(&Value::Int(1), &Value::Text("1".into()), BoolOp::Eq).is_err());
    }

    #[test]
    fn test_filter_ints() {
        let filter = Arc::new(
            Filter::new(
                Expr::field("n", DataType::Int),
                BoolOp::Gt,
                Expr::Const(Value::Int(5)),
                ints(&[3, 7, 5, 9]),
            )
            .unwrap(),
        );
        let rows = collect_rows(filter.iterator(TransactionId::new()).unwrap()).unwrap();
        let got: Vec<i64> = rows.iter().map(|t| t.values[0].as_int().unwrap()).collect();
        assert_eq!(got, vec![7, 9]);
    }

    #[test]
    fn test_filter_type_mismatch_rejected() {
        let result = Filter::new(
            Expr::field("n", DataType::Int),
            BoolOp::Eq,
            Expr::Const(Value::Text("x".into())),
            ints(&[1]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_like_requires_strings() {
        let result = Filter::new(
            Expr::field("n", DataType::Int),
            BoolOp::Like,
            Expr::Const(Value::Int(1)),
            ints(&[1]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_descriptor_passthrough() {
        let filter = Filter::new(
            Expr::field("n", DataType::Int),
            BoolOp::Eq,
            Expr::Const(Value::Int(1)),
            ints(&[1]),
        )
        .unwrap();
        assert_eq!(
            filter.descriptor().fields,
            vec![FieldDesc::new("n", DataType::Int)]
        );
    }
}
