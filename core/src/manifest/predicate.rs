//! Structured row predicates and scalar expressions

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{LakeError, LakeResult};
use crate::manifest::{ColumnStats, EntryStats};
use crate::schema::SchemaVersion;
use crate::value::{Row, Value};

/// Scalar expression evaluated against a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Column(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn col(name: &str) -> Self {
        Expr::Column(name.to_string())
    }

    pub fn add(self, other: Expr) -> Self {
        Expr::Add(Box::new(self), Box::new(other))
    }

    pub fn sub(self, other: Expr) -> Self {
        Expr::Sub(Box::new(self), Box::new(other))
    }

    pub fn mul(self, other: Expr) -> Self {
        Expr::Mul(Box::new(self), Box::new(other))
    }

    pub fn eval(&self, row: &Row) -> LakeResult<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Column(name) => row
                .get(name)
                .cloned()
                .ok_or_else(|| LakeError::ColumnNotFound(name.clone())),
            Expr::Add(a, b) => a.eval(row)?.add(&b.eval(row)?),
            Expr::Sub(a, b) => a.eval(row)?.sub(&b.eval(row)?),
            Expr::Mul(a, b) => a.eval(row)?.mul(&b.eval(row)?),
        }
    }

    /// Check that every referenced column exists in `schema`
    pub fn validate(&self, schema: &SchemaVersion) -> LakeResult<()> {
        match self {
            Expr::Literal(_) => Ok(()),
            Expr::Column(name) => schema.column(name).map(|_| ()),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.validate(schema)?;
                b.validate(schema)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches every row
    All,
    Eq(String, Value),
    NotEq(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    IsNull(String),
    IsNotNull(String),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.to_string(), value.into())
    }

    pub fn not_eq(column: &str, value: impl Into<Value>) -> Self {
        Predicate::NotEq(column.to_string(), value.into())
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Lt(column.to_string(), value.into())
    }

    pub fn le(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Le(column.to_string(), value.into())
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Gt(column.to_string(), value.into())
    }

    pub fn ge(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Ge(column.to_string(), value.into())
    }

    pub fn is_null(column: &str) -> Self {
        Predicate::IsNull(column.to_string())
    }

    pub fn is_not_null(column: &str) -> Self {
        Predicate::IsNotNull(column.to_string())
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Resolve column names against `schema` and cast literals to the
    /// column types, so that evaluation compares like with like.
    pub fn bind(&self, schema: &SchemaVersion) -> LakeResult<Predicate> {
        let cast = |column: &str, value: &Value| -> LakeResult<(String, Value)> {
            let def = schema.column(column)?;
            Ok((def.name.clone(), value.cast_to(&def.data_type)?))
        };
        Ok(match self {
            Predicate::All => Predicate::All,
            Predicate::Eq(c, v) => {
                let (c, v) = cast(c, v)?;
                Predicate::Eq(c, v)
            }
            Predicate::NotEq(c, v) => {
                let (c, v) = cast(c, v)?;
                Predicate::NotEq(c, v)
            }
            Predicate::Lt(c, v) => {
                let (c, v) = cast(c, v)?;
                Predicate::Lt(c, v)
            }
            Predicate::Le(c, v) => {
                let (c, v) = cast(c, v)?;
                Predicate::Le(c, v)
            }
            Predicate::Gt(c, v) => {
                let (c, v) = cast(c, v)?;
                Predicate::Gt(c, v)
            }
            Predicate::Ge(c, v) => {
                let (c, v) = cast(c, v)?;
                Predicate::Ge(c, v)
            }
            Predicate::IsNull(c) => Predicate::IsNull(schema.column(c)?.name.clone()),
            Predicate::IsNotNull(c) => Predicate::IsNotNull(schema.column(c)?.name.clone()),
            Predicate::And(a, b) => a.bind(schema)?.and(b.bind(schema)?),
            Predicate::Or(a, b) => a.bind(schema)?.or(b.bind(schema)?),
            Predicate::Not(p) => p.bind(schema)?.not(),
        })
    }

    /// Evaluate against a projected row. NULL comparisons never match.
    pub fn matches(&self, row: &Row) -> LakeResult<bool> {
        Ok(self.eval3(row)? == Some(true))
    }

    fn eval3(&self, row: &Row) -> LakeResult<Option<bool>> {
        let get = |c: &String| {
            row.get(c)
                .ok_or_else(|| LakeError::ColumnNotFound(c.clone()))
        };
        let cmp = |c: &String, v: &Value, ok: fn(Ordering) -> bool| -> LakeResult<Option<bool>> {
            Ok(get(c)?.compare(v).map(ok))
        };
        match self {
            Predicate::All => Ok(Some(true)),
            Predicate::Eq(c, v) => cmp(c, v, |o| o == Ordering::Equal),
            Predicate::NotEq(c, v) => cmp(c, v, |o| o != Ordering::Equal),
            Predicate::Lt(c, v) => cmp(c, v, |o| o == Ordering::Less),
            Predicate::Le(c, v) => cmp(c, v, |o| o != Ordering::Greater),
            Predicate::Gt(c, v) => cmp(c, v, |o| o == Ordering::Greater),
            Predicate::Ge(c, v) => cmp(c, v, |o| o != Ordering::Less),
            Predicate::IsNull(c) => Ok(Some(get(c)?.is_null())),
            Predicate::IsNotNull(c) => Ok(Some(!get(c)?.is_null())),
            Predicate::And(a, b) => Ok(match (a.eval3(row)?, b.eval3(row)?) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            }),
            Predicate::Or(a, b) => Ok(match (a.eval3(row)?, b.eval3(row)?) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            }),
            Predicate::Not(p) => Ok(p.eval3(row)?.map(|b| !b)),
        }
    }

    /// Whether an entry with these statistics can contain a matching row.
    /// False only when the stats prove no row matches.
    pub fn may_match(&self, schema: &SchemaVersion, stats: &EntryStats, row_count: u64) -> bool {
        let effective = |column: &str| -> Option<ColumnStats> {
            let def = schema.column(column).ok()?;
            let mut s = stats.get(&def.id).cloned().unwrap_or_default();
            // Rows written before the column existed read its initial default
            let missing = row_count.saturating_sub(s.value_count);
            if missing > 0 {
                let fill = def.initial_default.clone().unwrap_or(Value::Null);
                let bound = (!fill.is_null()).then(|| fill.clone());
                let extra = ColumnStats {
                    min: bound.clone(),
                    max: bound,
                    null_count: if fill.is_null() { missing } else { 0 },
                    value_count: missing,
                };
                s = s.combine(&extra);
            }
            Some(s)
        };

        // Unknown ordering (e.g. after a type change) never prunes
        let range = |column: &str, check: &dyn Fn(&ColumnStats) -> Option<bool>| {
            effective(column).is_none_or(|s| check(&s).unwrap_or(true))
        };

        match self {
            Predicate::All => true,
            Predicate::Eq(c, v) => range(c, &|s: &ColumnStats| {
                if v.is_null() {
                    return Some(false);
                }
                let (min, max) = (s.min.as_ref()?, s.max.as_ref()?);
                Some(
                    min.compare(v)? != Ordering::Greater && max.compare(v)? != Ordering::Less,
                )
            }) && !all_null(effective(c)),
            Predicate::NotEq(c, v) => range(c, &|s: &ColumnStats| {
                let (min, max) = (s.min.as_ref()?, s.max.as_ref()?);
                Some(!(min.sql_eq(v) && max.sql_eq(v)))
            }) && !all_null(effective(c)),
            Predicate::Lt(c, v) => range(c, &|s: &ColumnStats| {
                Some(s.min.as_ref()?.compare(v)? == Ordering::Less)
            }) && !all_null(effective(c)),
            Predicate::Le(c, v) => range(c, &|s: &ColumnStats| {
                Some(s.min.as_ref()?.compare(v)? != Ordering::Greater)
            }) && !all_null(effective(c)),
            Predicate::Gt(c, v) => range(c, &|s: &ColumnStats| {
                Some(s.max.as_ref()?.compare(v)? == Ordering::Greater)
            }) && !all_null(effective(c)),
            Predicate::Ge(c, v) => range(c, &|s: &ColumnStats| {
                Some(s.max.as_ref()?.compare(v)? != Ordering::Less)
            }) && !all_null(effective(c)),
            Predicate::IsNull(c) => range(c, &|s: &ColumnStats| Some(s.null_count > 0)),
            Predicate::IsNotNull(c) => range(c, &|s: &ColumnStats| Some(s.value_count > s.null_count)),
            Predicate::And(a, b) => {
                a.may_match(schema, stats, row_count) && b.may_match(schema, stats, row_count)
            }
            Predicate::Or(a, b) => {
                a.may_match(schema, stats, row_count) || b.may_match(schema, stats, row_count)
            }
            Predicate::Not(_) => true,
        }
    }
}

fn all_null(stats: Option<ColumnStats>) -> bool {
    stats.is_some_and(|s| s.value_count > 0 && s.null_count == s.value_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ColumnId, RowId};
    use crate::manifest::{StoredRow, compute_stats};
    use crate::schema::{ColumnDef, SchemaVersion};
    use crate::value::DataType;
    use std::collections::BTreeMap;

    fn schema() -> SchemaVersion {
        SchemaVersion::initial(
            "t",
            vec![
                ColumnDef::new("id", DataType::Integer).not_null(),
                ColumnDef::new("qty", DataType::Integer),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    fn stored(id: i64, qty: Option<i64>) -> StoredRow {
        let mut values = BTreeMap::from([(ColumnId(1), Value::Integer(id))]);
        values.insert(ColumnId(2), qty.map(Value::Integer).unwrap_or(Value::Null));
        StoredRow {
            row_id: RowId(id as u64),
            values,
        }
    }

    #[test]
    fn test_bind_casts_literals() {
        let bound = Predicate::eq("id", "7").bind(&schema()).unwrap();
        assert_eq!(bound, Predicate::Eq("id".into(), Value::Integer(7)));
        assert!(matches!(
            Predicate::eq("missing", 1).bind(&schema()),
            Err(LakeError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_null_comparisons_never_match() {
        let mut row = Row::new(RowId(1));
        row.insert("id".into(), Value::Integer(1));
        row.insert("qty".into(), Value::Null);

        assert!(!Predicate::gt("qty", 0).matches(&row).unwrap());
        assert!(!Predicate::gt("qty", 0).not().matches(&row).unwrap());
        assert!(Predicate::is_null("qty").matches(&row).unwrap());
        assert!(
            Predicate::eq("id", 1)
                .or(Predicate::gt("qty", 0))
                .matches(&row)
                .unwrap()
        );
    }

    #[test]
    fn test_stats_pruning() {
        let rows = vec![stored(1, Some(10)), stored(2, Some(20)), stored(3, None)];
        let stats = compute_stats(&rows);
        let s = schema();

        assert!(Predicate::eq("id", 2).may_match(&s, &stats, 3));
        assert!(!Predicate::eq("id", 9).may_match(&s, &stats, 3));
        assert!(!Predicate::gt("qty", 20).may_match(&s, &stats, 3));
        assert!(Predicate::is_null("qty").may_match(&s, &stats, 3));
        assert!(!Predicate::eq("id", 9).and(Predicate::All).may_match(&s, &stats, 3));
    }

    #[test]
    fn test_expr_eval() {
        let mut row = Row::new(RowId(1));
        row.insert("qty".into(), Value::Integer(100));
        let expr = Expr::col("qty").sub(Expr::lit(1));
        assert_eq!(expr.eval(&row).unwrap(), Value::Integer(99));
    }
}
