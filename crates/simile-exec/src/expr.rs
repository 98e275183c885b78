//! The expression sub-language evaluated against rows.

use simile_common::{Result, SimileError};
use simile_storage::{dot, DataType, FieldDesc, Tuple, Value};

/// Similarity scores are fixed-point: the value system has no float
/// scalar, so the negative dot product is scaled to i64 micro-units.
pub const AILIKE_SCALE: f64 = 1_000_000.0;

/// An expression over a row: a named field, a constant, or a function
/// application.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Extracts the named field from the row.
    Field(FieldDesc),
    /// A constant value, independent of the row.
    Const(Value),
    /// A function applied to argument expressions. The available functions
    /// are the similarity scorers `ailike` (embedded-text column) and
    /// `ailike_vec` (vector column).
    Func { name: String, args: Vec<Expr> },
}

impl Expr {
    /// Convenience constructor for a field reference.
    pub fn field(name: impl Into<String>, dtype: DataType) -> Expr {
        Expr::Field(FieldDesc::new(name, dtype))
    }

    /// Convenience constructor for the similarity score of a column
    /// against a constant query value.
    pub fn ailike(column: FieldDesc, query: Value) -> Expr {
        let name = match column.dtype {
            DataType::Vector => "ailike_vec",
            _ => "ailike",
        };
        Expr::Func {
            name: name.to_string(),
            args: vec![Expr::Field(column), Expr::Const(query)],
        }
    }

    /// The descriptor of the value this expression produces.
    pub fn expr_type(&self) -> Result<FieldDesc> {
        match self {
            Expr::Field(f) => Ok(f.clone()),
            Expr::Const(v) => Ok(FieldDesc::new("const", v.data_type())),
            Expr::Func { name, .. } => match name.as_str() {
                "ailike" | "ailike_vec" => Ok(FieldDesc::new(name.clone(), DataType::Int)),
                _ => Err(SimileError::IllegalOperation(format!(
                    "unknown function '{name}'"
                ))),
            },
        }
    }

    /// Evaluates this expression against a row.
    pub fn eval(&self, t: &Tuple) -> Result<Value> {
        match self {
            Expr::Field(f) => {
                let i = t.desc.resolve_field(f)?;
                Ok(t.values[i].clone())
            }
            Expr::Const(v) => Ok(v.clone()),
            Expr::Func { name, args } => match name.as_str() {
                "ailike" | "ailike_vec" => {
                    if args.len() != 2 {
                        return Err(SimileError::IllegalOperation(format!(
                            "{name} takes exactly two arguments"
                        )));
                    }
                    let left = args[0].eval(t)?;
                    let right = args[1].eval(t)?;
                    let a = embedding_of(&left)?;
                    let b = embedding_of(&right)?;
                    if a.len() != b.len() {
                        return Err(SimileError::IncompatibleTypes(format!(
                            "embedding dimensions differ: {} vs {}",
                            a.len(),
                            b.len()
                        )));
                    }
                    Ok(Value::Int(ailike_score(a, b)))
                }
                _ => Err(SimileError::IllegalOperation(format!(
                    "unknown function '{name}'"
                ))),
            },
        }
    }

    /// Evaluates a constant expression without a row; errors if the
    /// expression reads fields.
    pub fn eval_const(&self) -> Result<Value> {
        match self {
            Expr::Const(v) => Ok(v.clone()),
            _ => Err(SimileError::IllegalOperation(
                "expression is not a constant".to_string(),
            )),
        }
    }
}

fn embedding_of(v: &Value) -> Result<&[f64]> {
    v.embedding().ok_or_else(|| {
        SimileError::IncompatibleTypes(format!(
            "{} value carries no embedding",
            v.data_type()
        ))
    })
}

/// Negative dot product in fixed-point micro-units; lower = more similar.
pub(crate) fn ailike_score(a: &[f64], b: &[f64]) -> i64 {
    (-dot(a, b) * AILIKE_SCALE).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use simile_storage::TupleDesc;

    fn doc_tuple() -> Tuple {
        Tuple::new(
            TupleDesc::new(vec![
                FieldDesc::new("id", DataType::Int),
                FieldDesc::new("v", DataType::Vector),
            ]),
            vec![Value::Int(7), Value::Vector(vec![1.0, 0.0, 0.0, 0.0])],
        )
    }

    #[test]
    fn test_field_eval() {
        let t = doc_tuple();
        let v = Expr::field("id", DataType::Int).eval(&t).unwrap();
        assert_eq!(v, Value::Int(7));
    }

    #[test]
    fn test_field_missing() {
        let t = doc_tuple();
        assert!(Expr::field("nope", DataType::Int).eval(&t).is_err());
    }

    #[test]
    fn test_const_eval() {
        let t = doc_tuple();
        let v = Expr::Const(Value::Int(3)).eval(&t).unwrap();
        assert_eq!(v, Value::Int(3));
        assert_eq!(Expr::Const(Value::Int(3)).eval_const().unwrap(), Value::Int(3));
    }

    #[test]
    fn test_eval_const_rejects_field() {
        assert!(Expr::field("id", DataType::Int).eval_const().is_err());
    }

    #[test]
    fn test_ailike_vec_score() {
        let t = doc_tuple();
        let expr = Expr::ailike(
            FieldDesc::new("v", DataType::Vector),
            Value::Vector(vec![0.9, 0.1, 0.0, 0.0]),
        );
        let v = expr.eval(&t).unwrap();
        // -dot([1,0,0,0],[0.9,0.1,0,0]) = -0.9, scaled by 1e6.
        assert_eq!(v, Value::Int(-900_000));
    }

    #[test]
    fn test_ailike_orders_by_similarity() {
        let query = vec![1.0, 0.0, 0.0, 0.0];
        let near = ailike_score(&[0.9, 0.1, 0.0, 0.0], &query);
        let far = ailike_score(&[0.0, 1.0, 0.0, 0.0], &query);
        assert!(near < far, "more similar scores lower");
    }

    #[test]
    fn test_ailike_on_embedded_text() {
        let desc = TupleDesc::new(vec![FieldDesc::new("content", DataType::EmbeddedText)]);
        let t = Tuple::new(
            desc,
            vec![Value::EmbeddedText {
                text: "hi".into(),
                embedding: vec![0.0, 1.0, 0.0, 0.0],
            }],
        );
        let expr = Expr::ailike(
            FieldDesc::new("content", DataType::EmbeddedText),
            Value::EmbeddedText {
                text: "query".into(),
                embedding: vec![0.0, 0.5, 0.0, 0.0],
            },
        );
        assert_eq!(expr.eval(&t).unwrap(), Value::Int(-500_000));
    }

    #[test]
    fn test_ailike_missing_embedding() {
        let desc = TupleDesc::new(vec![FieldDesc::new("content", DataType::EmbeddedText)]);
        let t = Tuple::new(
            desc,
            vec![Value::EmbeddedText {
                text: "no emb".into(),
                embedding: vec![],
            }],
        );
        let expr = Expr::ailike(
            FieldDesc::new("content", DataType::EmbeddedText),
            Value::Vector(vec![1.0, 0.0, 0.0, 0.0]),
        );
        assert!(expr.eval(&t).is_err());
    }

    #[test]
    fn test_unknown_function() {
        let expr = Expr::Func {
            name: "sqrt".into(),
            args: vec![],
        };
        assert!(expr.eval(&doc_tuple()).is_err());
        assert!(expr.expr_type().is_err());
    }

    #[test]
    fn test_expr_type() {
        assert_eq!(
            Expr::field("id", DataType::Int).expr_type().unwrap().dtype,
            DataType::Int
        );
        let sim = Expr::ailike(
            FieldDesc::new("v", DataType::Vector),
            Value::Vector(vec![0.0; 4]),
        );
        assert_eq!(sim.expr_type().unwrap().dtype, DataType::Int);
    }
}
