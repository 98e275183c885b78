//! Aggregation operator and its per-function states.

use crate::expr::Expr;
use simile_common::{Result, SimileError, TransactionId};
use simile_storage::{
    compare_values, join_tuples, DataType, FieldDesc, Operator, RowSource, Tuple, TupleDesc, Value,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Incremental state for one aggregation function.
///
/// A state instance held by the [`Aggregator`] acts as a template; each
/// group gets its own zeroed copy via [`AggState::fresh`].
pub trait AggState: Send + Sync {
    /// A zeroed copy of this state with the same alias and expression.
    fn fresh(&self) -> Box<dyn AggState>;

    /// Folds one input row into the state.
    fn add(&mut self, t: &Tuple) -> Result<()>;

    /// The single-field result row.
    fn finalize(&self) -> Tuple;

    /// Descriptor of the result row.
    fn desc(&self) -> TupleDesc;
}

/// COUNT(*).
pub struct CountAgg {
    alias: String,
    count: i64,
}

impl CountAgg {
    pub fn new(alias: impl Into<String>) -> Box<dyn AggState> {
        Box::new(CountAgg {
            alias: alias.into(),
            count: 0,
        })
    }
}

impl AggState for CountAgg {
    fn fresh(&self) -> Box<dyn AggState> {
        CountAgg::new(self.alias.clone())
    }

    fn add(&mut self, _t: &Tuple) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn finalize(&self) -> Tuple {
        Tuple::new(self.desc(), vec![Value::Int(self.count)])
    }

    fn desc(&self) -> TupleDesc {
        TupleDesc::new(vec![FieldDesc::new(self.alias.clone(), DataType::Int)])
    }
}

/// SUM over an integer expression.
pub struct SumAgg {
    alias: String,
    expr: Expr,
    sum: i64,
}

impl SumAgg {
    pub fn new(alias: impl Into<String>, expr: Expr) -> Box<dyn AggState> {
        Box::new(SumAgg {
            alias: alias.into(),
            expr,
            sum: 0,
        })
    }
}

impl AggState for SumAgg {
    fn fresh(&self) -> Box<dyn AggState> {
        SumAgg::new(self.alias.clone(), self.expr.clone())
    }

    fn add(&mut self, t: &Tuple) -> Result<()> {
        self.sum += self.expr.eval(t)?.as_int()?;
        Ok(())
    }

    fn finalize(&self) -> Tuple {
        Tuple::new(self.desc(), vec![Value::Int(self.sum)])
    }

    fn desc(&self) -> TupleDesc {
        TupleDesc::new(vec![FieldDesc::new(self.alias.clone(), DataType::Int)])
    }
}

/// AVG over an integer expression. Integer division; zero rows average
/// to zero.
pub struct AvgAgg {
    alias: String,
    expr: Expr,
    sum: i64,
    count: i64,
}

impl AvgAgg {
    pub fn new(alias: impl Into<String>, expr: Expr) -> Box<dyn AggState> {
        Box::new(AvgAgg {
            alias: alias.into(),
            expr,
            sum: 0,
            count: 0,
        })
    }
}

impl AggState for AvgAgg {
    fn fresh(&self) -> Box<dyn AggState> {
        AvgAgg::new(self.alias.clone(), self.expr.clone())
    }

    fn add(&mut self, t: &Tuple) -> Result<()> {
        self.sum += self.expr.eval(t)?.as_int()?;
        self.count += 1;
        Ok(())
    }

    fn finalize(&self) -> Tuple {
        let avg = if self.count == 0 {
            0
        } else {
            self.sum / self.count
        };
        Tuple::new(self.desc(), vec![Value::Int(avg)])
    }

    fn desc(&self) -> TupleDesc {
        TupleDesc::new(vec![FieldDesc::new(self.alias.clone(), DataType::Int)])
    }
}

/// MIN or MAX over an int or string expression; first-seen initialization.
struct ExtremeAgg {
    alias: String,
    expr: Expr,
    dtype: DataType,
    keep: Ordering,
    best: Option<Value>,
}

impl AggState for ExtremeAgg {
    fn fresh(&self) -> Box<dyn AggState> {
        Box::new(ExtremeAgg {
            alias: self.alias.clone(),
            expr: self.expr.clone(),
            dtype: self.dtype,
            keep: self.keep,
            best: None,
        })
    }

    fn add(&mut self, t: &Tuple) -> Result<()> {
        let v = self.expr.eval(t)?;
        match &self.best {
            None => self.best = Some(v),
            Some(current) => {
                if compare_values(&v, current)? == self.keep {
                    self.best = Some(v);
                }
            }
        }
        Ok(())
    }

    fn finalize(&self) -> Tuple {
        let value = match &self.best {
            Some(v) => v.clone(),
            // No input rows; zero value of the column type.
            None => match self.dtype {
                DataType::Text => Value::Text(String::new()),
                _ => Value::Int(0),
            },
        };
        Tuple::new(self.desc(), vec![value])
    }

    fn desc(&self) -> TupleDesc {
        TupleDesc::new(vec![FieldDesc::new(self.alias.clone(), self.dtype)])
    }
}

/// MIN aggregation state.
pub struct MinAgg;

impl MinAgg {
    pub fn new(alias: impl Into<String>, expr: Expr, dtype: DataType) -> Box<dyn AggState> {
        Box::new(ExtremeAgg {
            alias: alias.into(),
            expr,
            dtype,
            keep: Ordering::Less,
            best: None,
        })
    }
}

/// MAX aggregation state.
pub struct MaxAgg;

impl MaxAgg {
    pub fn new(alias: impl Into<String>, expr: Expr, dtype: DataType) -> Box<dyn AggState> {
        Box::new(ExtremeAgg {
            alias: alias.into(),
            expr,
            dtype,
            keep: Ordering::Greater,
            best: None,
        })
    }
}

/// Computes a list of aggregations over the child, optionally grouped.
///
/// With no group-by the output is a single row; with one, each distinct
/// group key yields a row of the key fields followed by the aggregates,
/// in first-seen group order.
pub struct Aggregator {
    group_by: Option<Vec<Expr>>,
    templates: Vec<Box<dyn AggState>>,
    child: Arc<dyn Operator>,
}

impl Aggregator {
    /// Aggregator with no grouping.
    pub fn new(templates: Vec<Box<dyn AggState>>, child: Arc<dyn Operator>) -> Result<Aggregator> {
        if templates.is_empty() {
            return Err(SimileError::MalformedData(
                "aggregator needs at least one aggregation".to_string(),
            ));
        }
        Ok(Aggregator {
            group_by: None,
            templates,
            child,
        })
    }

    /// Aggregator grouped by the given key expressions.
    pub fn with_group_by(
        templates: Vec<Box<dyn AggState>>,
        group_by: Vec<Expr>,
        child: Arc<dyn Operator>,
    ) -> Result<Aggregator> {
        let mut agg = Aggregator::new(templates, child)?;
        agg.group_by = Some(group_by);
        Ok(agg)
    }

    fn group_desc(&self) -> Result<TupleDesc> {
        let Some(group_by) = &self.group_by else {
            return Ok(TupleDesc::default());
        };
        let fields = group_by
            .iter()
            .map(|e| e.expr_type())
            .collect::<Result<Vec<_>>>()?;
        Ok(TupleDesc::new(fields))
    }

    fn agg_desc(&self) -> TupleDesc {
        let mut desc = self.templates[0].desc();
        for template in &self.templates[1..] {
            desc = desc.merge(&template.desc());
        }
        desc
    }

    fn group_key_tuple(&self, t: &Tuple) -> Result<Option<Tuple>> {
        let Some(group_by) = &self.group_by else {
            return Ok(None);
        };
        let values = group_by
            .iter()
            .map(|e| e.eval(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Tuple::new(self.group_desc()?, values)))
    }
}

impl Operator for Aggregator {
    fn descriptor(&self) -> TupleDesc {
        let agg = self.agg_desc();
        match self.group_desc() {
            Ok(group) if !group.fields.is_empty() => group.merge(&agg),
            _ => agg,
        }
    }

    fn iterator(self: Arc<Self>, tid: TransactionId) -> Result<Box<dyn RowSource>> {
        let source = self.child.clone().iterator(tid)?;
        Ok(Box::new(AggSource {
            agg: self,
            source: Some(source),
            results: Vec::new(),
            next_result: 0,
        }))
    }
}

struct AggSource {
    agg: Arc<Aggregator>,
    source: Option<Box<dyn RowSource>>,
    results: Vec<Tuple>,
    next_result: usize,
}

impl AggSource {
    fn drain_child(&mut self) -> Result<()> {
        let Some(mut source) = self.source.take() else {
            return Ok(());
        };

        if self.agg.group_by.is_none() {
            let mut states: Vec<Box<dyn AggState>> =
                self.agg.templates.iter().map(|t| t.fresh()).collect();
            while let Some(t) = source.next()? {
                for state in &mut states {
                    state.add(&t)?;
                }
            }
            let mut row = Tuple::new(TupleDesc::default(), vec![]);
            for state in &states {
                row = join_tuples(&row, &state.finalize());
            }
            self.results.push(row);
            return Ok(());
        }

        // Grouped: one state vector per key, groups in first-seen order.
        let mut groups: HashMap<u64, Vec<Box<dyn AggState>>> = HashMap::new();
        let mut order: Vec<(u64, Tuple)> = Vec::new();
        while let Some(t) = source.next()? {
            let key_tuple = self
                .agg
                .group_key_tuple(&t)?
                .ok_or_else(|| SimileError::IllegalOperation("missing group key".into()))?;
            let key = key_tuple.row_key();
            let states = groups.entry(key).or_insert_with(|| {
                order.push((key, key_tuple));
                self.agg.templates.iter().map(|s| s.fresh()).collect()
            });
            for state in states {
                state.add(&t)?;
            }
        }

        for (key, key_tuple) in order {
            let states = groups
                .get(&key)
                .ok_or_else(|| SimileError::IllegalOperation("group state missing".into()))?;
            let mut row = key_tuple;
            for state in states {
                row = join_tuples(&row, &state.finalize());
            }
            self.results.push(row);
        }
        Ok(())
    }
}

impl RowSource for AggSource {
    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.source.is_some() {
            self.drain_child()?;
        }
        if self.next_result < self.results.len() {
            let t = self.results[self.next_result].clone();
            self.next_result += 1;
            Ok(Some(t))
        } else {
            Ok(None)
        }
    }
}
