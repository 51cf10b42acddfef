//! Type codes and the dynamic value carried through rows.

pub mod numeric;

pub use numeric::Numeric;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Logical data type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCode {
    #[default]
    String,
    Boolean,
    Int16,
    Int32,
    Int64,
    UInt64,
    Double,
    Decimal,
    DateTime,
    Date,
    Time,
    Guid,
    Binary,
    Json,
    Char,
    Unknown,
}

impl TypeCode {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Int16 | Self::Int32 | Self::Int64 | Self::UInt64 | Self::Double | Self::Decimal
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int16 | Self::Int32 | Self::Int64 | Self::UInt64)
    }

    fn integer_range(&self) -> (i128, i128) {
        match self {
            Self::Int16 => (i16::MIN as i128, i16::MAX as i128),
            Self::Int32 => (i32::MIN as i128, i32::MAX as i128),
            Self::UInt64 => (0, i64::MAX as i128),
            _ => (i64::MIN as i128, i64::MAX as i128),
        }
    }
}

/// A row is positional: index `i` holds the value of the table's column `i`.
pub type Row = Vec<Value>;

/// Dynamic cell value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    DateTime(NaiveDateTime),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    /// Nested row stream (child records of a hierarchical row).
    Rows(Vec<Row>),
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, or a string made only of whitespace.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// The type code that best describes this value on its own.
    pub fn type_code(&self) -> TypeCode {
        match self {
            Value::Null => TypeCode::Unknown,
            Value::Bool(_) => TypeCode::Boolean,
            Value::Int(_) => TypeCode::Int64,
            Value::Float(_) => TypeCode::Double,
            Value::Decimal(_) => TypeCode::Decimal,
            Value::String(_) => TypeCode::String,
            Value::DateTime(_) => TypeCode::DateTime,
            Value::Binary(_) => TypeCode::Binary,
            Value::Array(items) => items
                .iter()
                .find(|v| !v.is_null())
                .map(Value::type_code)
                .unwrap_or(TypeCode::Unknown),
            Value::Rows(_) => TypeCode::Unknown,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Value::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
                Some(*f as i64)
            }
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce into `target`. The error is a human-readable reason; callers
    /// attach the column name.
    pub fn convert(&self, target: TypeCode) -> Result<Value, String> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        if let Value::Array(items) = self {
            return items
                .iter()
                .map(|v| v.convert(target))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array);
        }
        if let Value::Rows(_) = self {
            return Ok(self.clone());
        }

        let fail = || format!("cannot convert {} to {:?}", self.describe(), target);

        match target {
            TypeCode::Unknown => Ok(self.clone()),
            TypeCode::String | TypeCode::Char => Ok(Value::String(self.to_string())),
            TypeCode::Boolean => match self {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" | "n" => Ok(Value::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            t if t.is_integer() => {
                let v = match self {
                    Value::Bool(b) => Some(*b as i64),
                    other => other.as_i64(),
                }
                .ok_or_else(fail)?;
                let (min, max) = t.integer_range();
                if (v as i128) < min || (v as i128) > max {
                    return Err(format!("{} is out of range for {:?}", v, t));
                }
                Ok(Value::Int(v))
            }
            TypeCode::Double => match self {
                Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
                other => Numeric::from_value(other)
                    .map(|n| Value::Float(n.to_f64()))
                    .ok_or_else(fail),
            },
            TypeCode::Decimal => match self {
                Value::Int(v) => Ok(Value::Decimal(Decimal::from(*v))),
                Value::Float(v) => Decimal::from_f64(*v).map(Value::Decimal).ok_or_else(fail),
                Value::Decimal(d) => Ok(Value::Decimal(*d)),
                Value::String(s) => s
                    .trim()
                    .parse::<Decimal>()
                    .map(Value::Decimal)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            TypeCode::DateTime => match self {
                Value::DateTime(d) => Ok(Value::DateTime(*d)),
                Value::String(s) => parse_datetime(s).map(Value::DateTime).ok_or_else(fail),
                _ => Err(fail()),
            },
            TypeCode::Date => match self {
                Value::DateTime(d) => Ok(Value::DateTime(d.date().and_time(NaiveTime::MIN))),
                Value::String(s) => parse_datetime(s)
                    .map(|d| Value::DateTime(d.date().and_time(NaiveTime::MIN)))
                    .ok_or_else(fail),
                _ => Err(fail()),
            },
            TypeCode::Time => match self {
                Value::DateTime(d) => Ok(Value::String(d.time().format("%H:%M:%S%.f").to_string())),
                Value::String(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            TypeCode::Guid => match self {
                Value::String(s) => uuid::Uuid::parse_str(s.trim())
                    .map(|u| Value::String(u.to_string()))
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            TypeCode::Binary => match self {
                Value::Binary(b) => Ok(Value::Binary(b.clone())),
                Value::String(s) => Ok(Value::Binary(s.as_bytes().to_vec())),
                _ => Err(fail()),
            },
            TypeCode::Json => match self {
                Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                    .map(|_| Value::String(s.clone()))
                    .map_err(|e| format!("invalid json: {}", e)),
                other => Ok(Value::String(serde_json::Value::from(other).to_string())),
            },
            _ => Ok(self.clone()),
        }
    }

    /// Three-way comparison with SQL-like null semantics: null compares
    /// to nothing.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::String(s)) => parse_datetime(s).map(|b| a.cmp(&b)),
            (Value::String(s), Value::DateTime(b)) => parse_datetime(s).map(|a| a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (a, b) => Numeric::from_value(a)?.compare(Numeric::from_value(b)?),
        }
    }

    /// Ordering for sorts: nulls first, incomparable values equal.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }

    fn describe(&self) -> String {
        match self {
            Value::String(s) => format!("'{}'", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::DateTime(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Rows(rows) => write!(f, "<{} rows>", rows.len()),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(v) => serde_json::Value::Number((*v).into()),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Into::into).collect()),
            Value::Rows(rows) => serde_json::Value::Array(
                rows.iter()
                    .map(|r| serde_json::Value::Array(r.iter().map(Into::into).collect()))
                    .collect(),
            ),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
