//! Column types and cell values

use crate::error::{LakeError, LakeResult};
use crate::ids::RowId;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

const MAX_DECIMAL_PRECISION: u8 = 18;

/// 10^exp, None past i64 range
fn pow10(exp: u8) -> Option<i64> {
    10i64.checked_pow(exp as u32)
}

/// Exact float to integer conversion: no fraction, NaN or saturation
fn f64_to_i64(f: f64) -> Option<i64> {
    // i64::MIN is exactly representable; i64::MAX rounds up to 2^63
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && (-BOUND..BOUND).contains(&f)).then_some(f as i64)
}

/// Column data types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    /// 32-bit signed integer
    Integer,
    BigInt,
    Double,
    Decimal { precision: u8, scale: u8 },
    Varchar,
    Timestamp,
    Json,
}

impl DataType {
    pub fn display_name(&self) -> String {
        match self {
            DataType::Boolean => "BOOLEAN".into(),
            DataType::Integer => "INTEGER".into(),
            DataType::BigInt => "BIGINT".into(),
            DataType::Double => "DOUBLE".into(),
            DataType::Decimal { precision, scale } => format!("DECIMAL({precision}, {scale})"),
            DataType::Varchar => "VARCHAR".into(),
            DataType::Timestamp => "TIMESTAMP".into(),
            DataType::Json => "JSON".into(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Integer | DataType::BigInt | DataType::Double | DataType::Decimal { .. }
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    /// Fixed-point number: `mantissa * 10^-scale`
    Decimal { mantissa: i64, scale: u8 },
    Text(String),
    Timestamp(DateTime<Utc>),
    /// JSON document, kept as validated text
    Json(String),
}

/// Numeric view used for arithmetic and cross-type comparison
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Dec(i64, u8),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Dec(m, s) => m as f64 / 10f64.powi(s as i32),
            Num::Float(f) => f,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::Double(_) => "DOUBLE",
            Value::Decimal { .. } => "DECIMAL",
            Value::Text(_) => "VARCHAR",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Json(_) => "JSON",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Json(s) => Some(s),
            _ => None,
        }
    }

    /// Rough in-memory footprint, used for inlining thresholds
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Double(_) | Value::Timestamp(_) => 8,
            Value::Decimal { .. } => 9,
            Value::Text(s) | Value::Json(s) => 8 + s.len(),
        }
    }

    fn as_num(&self) -> Option<Num> {
        match self {
            Value::Integer(i) => Some(Num::Int(*i)),
            Value::Double(f) => Some(Num::Float(*f)),
            Value::Decimal { mantissa, scale } => Some(Num::Dec(*mantissa, *scale)),
            _ => None,
        }
    }

    /// Cast to `target`. NULL casts to NULL for every type.
    pub fn cast_to(&self, target: &DataType) -> LakeResult<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        if let Value::Decimal { scale, .. } = self
            && *scale > MAX_DECIMAL_PRECISION
        {
            return Err(LakeError::InvalidInput(format!(
                "decimal scale {} exceeds {}",
                scale, MAX_DECIMAL_PRECISION
            )));
        }

        let fail = || LakeError::TypeMismatch {
            expected: target.display_name(),
            actual: format!("{} ({})", self.type_name(), self),
        };

        match target {
            DataType::Boolean => match self {
                Value::Boolean(b) => Ok(Value::Boolean(*b)),
                Value::Integer(i) => Ok(Value::Boolean(*i != 0)),
                Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" => Ok(Value::Boolean(true)),
                    "false" | "f" | "0" => Ok(Value::Boolean(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            DataType::Integer | DataType::BigInt => {
                let wide = match self {
                    Value::Integer(i) => *i,
                    Value::Boolean(b) => *b as i64,
                    Value::Double(f) => f64_to_i64(*f).ok_or_else(fail)?,
                    Value::Decimal { mantissa, scale } => {
                        let div = pow10(*scale).ok_or_else(fail)?;
                        if mantissa % div != 0 {
                            return Err(fail());
                        }
                        mantissa / div
                    }
                    Value::Text(s) => s.trim().parse::<i64>().map_err(|_| fail())?,
                    _ => return Err(fail()),
                };
                if *target == DataType::Integer && i32::try_from(wide).is_err() {
                    return Err(fail());
                }
                Ok(Value::Integer(wide))
            }
            DataType::Double => {
                let f = match self {
                    Value::Text(s) => s.trim().parse::<f64>().map_err(|_| fail())?,
                    other => other.as_num().map(Num::as_f64).ok_or_else(fail)?,
                };
                // Catalog metadata has no encoding for inf or NaN
                if !f.is_finite() {
                    return Err(LakeError::Validation(format!(
                        "DOUBLE value {} is not finite",
                        f
                    )));
                }
                Ok(Value::Double(f))
            }
            DataType::Decimal { precision, scale } => {
                if *precision > MAX_DECIMAL_PRECISION || scale > precision {
                    return Err(LakeError::InvalidInput(format!(
                        "unsupported decimal type {}",
                        target
                    )));
                }
                let factor = 10f64.powi(*scale as i32);
                let mantissa = match self {
                    Value::Integer(i) => pow10(*scale)
                        .and_then(|factor| i.checked_mul(factor))
                        .ok_or_else(fail)?,
                    Value::Decimal {
                        mantissa,
                        scale: from,
                    } => rescale(*mantissa, *from, *scale).ok_or_else(fail)?,
                    Value::Double(f) => f64_to_i64((f * factor).round()).ok_or_else(fail)?,
                    Value::Text(s) => {
                        let f = s.trim().parse::<f64>().map_err(|_| fail())?;
                        f64_to_i64((f * factor).round()).ok_or_else(fail)?
                    }
                    _ => return Err(fail()),
                };
                let limit = pow10(*precision).ok_or_else(fail)?;
                if mantissa.unsigned_abs() >= limit.unsigned_abs() {
                    return Err(fail());
                }
                Ok(Value::Decimal {
                    mantissa,
                    scale: *scale,
                })
            }
            DataType::Varchar => match self {
                Value::Text(s) | Value::Json(s) => Ok(Value::Text(s.clone())),
                other => Ok(Value::Text(other.to_string())),
            },
            DataType::Timestamp => match self {
                Value::Timestamp(ts) => Ok(Value::Timestamp(*ts)),
                Value::Text(s) => parse_timestamp(s).map(Value::Timestamp).ok_or_else(fail),
                _ => Err(fail()),
            },
            DataType::Json => match self {
                Value::Json(s) => Ok(Value::Json(s.clone())),
                Value::Text(s) => serde_json::from_str::<serde_json::Value>(s)
                    .map(|_| Value::Json(s.clone()))
                    .map_err(|_| fail()),
                Value::Integer(_) | Value::Boolean(_) => Ok(Value::Json(self.to_string())),
                Value::Double(f) if f.is_finite() => Ok(Value::Json(self.to_string())),
                _ => Err(fail()),
            },
        }
    }

    /// Compare two values. Numeric types compare across representations;
    /// NULL and mismatched kinds are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (
                Value::Decimal {
                    mantissa: a,
                    scale: sa,
                },
                Value::Decimal {
                    mantissa: b,
                    scale: sb,
                },
            ) if sa == sb => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (a, b) => {
                let (x, y) = (a.as_num()?, b.as_num()?);
                x.as_f64().partial_cmp(&y.as_f64())
            }
        }
    }

    /// SQL-style equality; NULL never equals anything
    pub fn sql_eq(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Canonical form used as a hash key for uniqueness checks
    pub fn canonical_key(&self) -> String {
        match self.as_num() {
            Some(Num::Int(i)) => format!("n:{i}"),
            Some(Num::Dec(m, s)) => match pow10(s) {
                Some(div) if m % div == 0 => format!("n:{}", m / div),
                _ => format!("f:{}", m as f64 / 10f64.powi(s as i32)),
            },
            Some(n) => format!("f:{}", n.as_f64()),
            None => format!("{:?}", self),
        }
    }

    pub fn add(&self, other: &Value) -> LakeResult<Value> {
        self.arith(other, "+", i64::checked_add, |a, b| a + b)
    }

    pub fn sub(&self, other: &Value) -> LakeResult<Value> {
        self.arith(other, "-", i64::checked_sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> LakeResult<Value> {
        if self.is_null() || other.is_null() {
            return Ok(Value::Null);
        }
        match (self.as_num(), other.as_num()) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => a
                .checked_mul(b)
                .map(Value::Integer)
                .ok_or_else(|| LakeError::InvalidInput("integer overflow in *".into())),
            (Some(Num::Dec(a, sa)), Some(Num::Int(b))) | (Some(Num::Int(b)), Some(Num::Dec(a, sa))) => a
                .checked_mul(b)
                .map(|mantissa| Value::Decimal {
                    mantissa,
                    scale: sa,
                })
                .ok_or_else(|| LakeError::InvalidInput("decimal overflow in *".into())),
            (Some(a), Some(b)) => Ok(Value::Double(a.as_f64() * b.as_f64())),
            _ => Err(self.arith_error(other, "*")),
        }
    }

    fn arith(
        &self,
        other: &Value,
        op: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> LakeResult<Value> {
        if self.is_null() || other.is_null() {
            return Ok(Value::Null);
        }
        let overflow = || LakeError::InvalidInput(format!("numeric overflow in {op}"));
        match (self.as_num(), other.as_num()) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => {
                int_op(a, b).map(Value::Integer).ok_or_else(overflow)
            }
            (Some(Num::Dec(a, sa)), Some(Num::Dec(b, sb))) => {
                let scale = sa.max(sb);
                let a = rescale(a, sa, scale).ok_or_else(overflow)?;
                let b = rescale(b, sb, scale).ok_or_else(overflow)?;
                int_op(a, b)
                    .map(|mantissa| Value::Decimal { mantissa, scale })
                    .ok_or_else(overflow)
            }
            (Some(Num::Dec(a, s)), Some(Num::Int(b))) => {
                let b = rescale(b, 0, s).ok_or_else(overflow)?;
                int_op(a, b)
                    .map(|mantissa| Value::Decimal { mantissa, scale: s })
                    .ok_or_else(overflow)
            }
            (Some(Num::Int(a)), Some(Num::Dec(b, s))) => {
                let a = rescale(a, 0, s).ok_or_else(overflow)?;
                int_op(a, b)
                    .map(|mantissa| Value::Decimal { mantissa, scale: s })
                    .ok_or_else(overflow)
            }
            (Some(a), Some(b)) => Ok(Value::Double(float_op(a.as_f64(), b.as_f64()))),
            _ => Err(self.arith_error(other, op)),
        }
    }

    fn arith_error(&self, other: &Value, op: &str) -> LakeError {
        LakeError::TypeMismatch {
            expected: "numeric operands".into(),
            actual: format!("{} {} {}", self.type_name(), op, other.type_name()),
        }
    }
}

fn rescale(mantissa: i64, from: u8, to: u8) -> Option<i64> {
    if to >= from {
        mantissa.checked_mul(10i64.checked_pow((to - from) as u32)?)
    } else {
        let div = pow10(from - to)?;
        let half = div / 2;
        let adjusted = if mantissa >= 0 {
            mantissa.checked_add(half)?
        } else {
            mantissa.checked_sub(half)?
        };
        Some(adjusted / div)
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Decimal { mantissa, scale } => {
                if *scale == 0 {
                    return write!(f, "{mantissa}");
                }
                let Some(div) = pow10(*scale) else {
                    return write!(f, "{mantissa}e-{scale}");
                };
                let sign = if *mantissa < 0 { "-" } else { "" };
                let abs = mantissa.unsigned_abs();
                let div = div.unsigned_abs();
                write!(
                    f,
                    "{sign}{}.{:0width$}",
                    abs / div,
                    abs % div,
                    width = *scale as usize
                )
            }
            Value::Text(s) | Value::Json(s) => f.write_str(s),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

/// A row as seen through a schema: column name to value
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub row_id: RowId,
    pub data: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(row_id: RowId) -> Self {
        Self {
            row_id,
            data: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, column: String, value: Value) {
        self.data.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_narrowing() {
        assert_eq!(
            Value::Integer(42).cast_to(&DataType::Integer).unwrap(),
            Value::Integer(42)
        );
        assert!(
            Value::Integer(i64::from(i32::MAX) + 1)
                .cast_to(&DataType::Integer)
                .is_err()
        );
        assert!(Value::Double(1.5).cast_to(&DataType::BigInt).is_err());
        assert_eq!(
            Value::Text(" 17 ".into()).cast_to(&DataType::BigInt).unwrap(),
            Value::Integer(17)
        );
    }

    #[test]
    fn test_decimal_cast_and_display() {
        let price = Value::Double(29.99)
            .cast_to(&DataType::Decimal {
                precision: 10,
                scale: 2,
            })
            .unwrap();
        assert_eq!(
            price,
            Value::Decimal {
                mantissa: 2999,
                scale: 2
            }
        );
        assert_eq!(price.to_string(), "29.99");
        assert_eq!(
            Value::Decimal {
                mantissa: -5,
                scale: 2
            }
            .to_string(),
            "-0.05"
        );
    }

    #[test]
    fn test_json_cast_requires_valid_document() {
        let ok = Value::Text(r#"{"count": 1}"#.into()).cast_to(&DataType::Json);
        assert!(matches!(ok, Ok(Value::Json(_))));
        let bad = Value::Text("not json".into()).cast_to(&DataType::Json);
        assert!(matches!(bad, Err(LakeError::TypeMismatch { .. })));
    }

    #[test]
    fn test_cross_numeric_compare() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Double(2.5)),
            Some(Ordering::Less)
        );
        assert!(Value::Null.compare(&Value::Integer(1)).is_none());
        assert!(!Value::Null.sql_eq(&Value::Null));
        assert_eq!(
            Value::Integer(3).canonical_key(),
            Value::Decimal {
                mantissa: 300,
                scale: 2
            }
            .canonical_key()
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            Value::Integer(100).sub(&Value::Integer(5)).unwrap(),
            Value::Integer(95)
        );
        assert_eq!(
            Value::Decimal {
                mantissa: 1499,
                scale: 2
            }
            .add(&Value::Integer(1))
            .unwrap(),
            Value::Decimal {
                mantissa: 1599,
                scale: 2
            }
        );
        assert_eq!(Value::Null.add(&Value::Integer(1)).unwrap(), Value::Null);
        assert!(Value::Text("a".into()).add(&Value::Integer(1)).is_err());
    }

    #[test]
    fn test_lossy_float_casts_are_rejected() {
        for f in [1e20, -1e20, f64::NAN] {
            assert!(matches!(
                Value::Double(f).cast_to(&DataType::BigInt),
                Err(LakeError::TypeMismatch { .. })
            ));
        }
        assert_eq!(
            Value::Double(-9.0e15).cast_to(&DataType::BigInt).unwrap(),
            Value::Integer(-9_000_000_000_000_000)
        );

        let money = DataType::Decimal {
            precision: 18,
            scale: 2,
        };
        assert!(Value::Double(f64::NAN).cast_to(&money).is_err());
        assert!(Value::Text("1e30".into()).cast_to(&money).is_err());
        assert!(
            Value::Decimal {
                mantissa: i64::MIN,
                scale: 0
            }
            .cast_to(&money)
            .is_err()
        );
    }

    #[test]
    fn test_non_finite_doubles_are_rejected() {
        for v in [
            Value::Double(f64::INFINITY),
            Value::Double(f64::NEG_INFINITY),
            Value::Double(f64::NAN),
            Value::Text("inf".into()),
            Value::Text("NaN".into()),
        ] {
            assert!(matches!(
                v.cast_to(&DataType::Double),
                Err(LakeError::Validation(_))
            ));
        }
        assert!(Value::Double(f64::NAN).cast_to(&DataType::Json).is_err());
        assert_eq!(
            Value::Double(2.5).cast_to(&DataType::Double).unwrap(),
            Value::Double(2.5)
        );
    }

    #[test]
    fn test_decimal_scale_beyond_i64() {
        let tiny = Value::Decimal {
            mantissa: 1,
            scale: 20,
        };
        assert!(matches!(
            tiny.cast_to(&DataType::BigInt),
            Err(LakeError::InvalidInput(_))
        ));
        assert!(matches!(
            tiny.cast_to(&DataType::Varchar),
            Err(LakeError::InvalidInput(_))
        ));
        assert_eq!(tiny.to_string(), "1e-20");
        assert!(tiny.canonical_key().starts_with("f:"));
        assert!(tiny.add(&Value::Integer(1)).is_err());
    }

    #[test]
    fn test_timestamp_parse() {
        let v = Value::Text("2024-01-01 00:00:00".into())
            .cast_to(&DataType::Timestamp)
            .unwrap();
        assert_eq!(v.to_string(), "2024-01-01 00:00:00");
    }
}
