//! Projection operator.

use crate::expr::Expr;
use simile_common::{Result, SimileError, TransactionId};
use simile_storage::{FieldDesc, Operator, RowSource, Tuple, TupleDesc};
use std::collections::HashSet;
use std::sync::Arc;

/// Computes a tuple of expressions per input row, optionally deduplicating
/// the output (DISTINCT).
pub struct Project {
    exprs: Vec<Expr>,
    desc: TupleDesc,
    distinct: bool,
    child: Arc<dyn Operator>,
}

impl Project {
    pub fn new(
        exprs: Vec<Expr>,
        output_names: Vec<String>,
        distinct: bool,
        child: Arc<dyn Operator>,
    ) -> Result<Project> {
        if exprs.len() != output_names.len() {
            return Err(SimileError::MalformedData(
                "projection expressions and output names differ in length".to_string(),
            ));
        }
        let fields = exprs
            .iter()
            .zip(&output_names)
            .map(|(expr, name)| {
                let et = expr.expr_type()?;
                Ok(FieldDesc {
                    name: name.clone(),
                    qualifier: et.qualifier,
                    dtype: et.dtype,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Project {
            exprs,
            desc: TupleDesc::new(fields),
            distinct,
            child,
        })
    }
}

impl Operator for Project {
    fn descriptor(&self) -> TupleDesc {
        self.desc.clone()
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        let source = self.child.clone().iterator(tid)?;
        let desc = self.descriptor();
        Ok(Box::new(ProjectSource {
            project: self,
            desc,
            source,
            seen: HashSet::new(),
        }))
    }
}

struct ProjectSource {
    project: Arc<Project>,
    desc: TupleDesc,
    source: Box<dyn RowSource>,
    seen: HashSet<u64>,
}

impl RowSource for ProjectSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        while let Some(t) = self.source.next()? {
            let values = self
                .project
                .exprs
                .iter()
                .map(|e| e.eval(&t))
                .collect::<Result<Vec<_>>>()?;
            let out = Tuple::new(self.desc.clone(), values);
            if self.project.distinct && !self.seen.insert(out.row_key()) {
                continue;
            }
            return Ok(Some(out));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::VecOperator;
    use simile_storage::{collect_rows, DataType, Value};

    #[test]
    fn test_project_renames() {
        let child = VecOperator::of_ints("n", &[1, 2]);
        let project = Arc::new(
            Project::new(
                vec![Expr::field("n", DataType::Int)],
                vec!["renamed".to_string()],
                false,
                child,
            )
            .unwrap(),
        );
        assert_eq!(project.descriptor().fields[0].name, "renamed");
        let rows = collect_rows(project.iterator(TransactionId::new()).unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[0], Value::Int(1));
    }

    #[test]
    fn test_project_distinct() {
        let child = VecOperator::of_ints("n", &[1, 2, 1, 2, 3]);
        let project = Arc::new(
            Project::new(
                vec![Expr::field("n", DataType::Int)],
                vec!["n".to_string()],
                true,
                child,
            )
            .unwrap(),
        );
        let rows = collect_rows(project.iterator(TransactionId::new()).unwrap()).unwrap();
        let got: Vec<i64> = rows.iter().map(|t| t.values[0].as_int().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn test_project_length_mismatch() {
        let child = VecOperator::of_ints("n", &[1]);
        assert!(Project::new(
            vec![Expr::field("n", DataType::Int)],
            vec![],
            false,
            child
        )
        .is_err());
    }
}
