//! Arithmetic over the closed set of numeric kinds.
//!
//! Aggregates (sum, average, min, max) and numeric comparisons dispatch
//! through [`Numeric`] instead of per-type generic code. Mixed operands are
//! widened: `Int + Decimal` yields `Decimal`, anything with `Float` yields
//! `Float`.

use super::Value;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
    Decimal(Decimal),
}

impl Numeric {
    /// Numeric view of a value. Strings are parsed; other variants are not numeric.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(Self::Int(*v)),
            Value::Float(v) => Some(Self::Float(*v)),
            Value::Decimal(v) => Some(Self::Decimal(*v)),
            Value::String(s) => Self::parse(s),
            _ => None,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(v) = text.parse::<i64>() {
            return Some(Self::Int(v));
        }
        if let Ok(v) = text.parse::<Decimal>() {
            return Some(Self::Decimal(v));
        }
        text.parse::<f64>().ok().map(Self::Float)
    }

    pub fn zero() -> Self {
        Self::Int(0)
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Int(v) => Value::Int(v),
            Self::Float(v) => Value::Float(v),
            Self::Decimal(v) => Value::Decimal(v),
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
            Self::Decimal(v) => v.to_f64().unwrap_or(f64::NAN),
        }
    }

    fn to_decimal(self) -> Option<Decimal> {
        match self {
            Self::Int(v) => Some(Decimal::from(v)),
            Self::Float(v) => Decimal::from_f64(v),
            Self::Decimal(v) => Some(v),
        }
    }

    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => match a.checked_add(b) {
                Some(v) => Self::Int(v),
                None => Self::Decimal(Decimal::from(a) + Decimal::from(b)),
            },
            (Self::Float(_), _) | (_, Self::Float(_)) => Self::Float(self.to_f64() + other.to_f64()),
            _ => match (self.to_decimal(), other.to_decimal()) {
                (Some(a), Some(b)) => a
                    .checked_add(b)
                    .map(Self::Decimal)
                    .unwrap_or_else(|| Self::Float(self.to_f64() + other.to_f64())),
                _ => Self::Float(self.to_f64() + other.to_f64()),
            },
        }
    }

    pub fn subtract(self, other: Self) -> Self {
        let negated = match other {
            Self::Int(v) => match v.checked_neg() {
                Some(n) => Self::Int(n),
                None => Self::Decimal(-Decimal::from(v)),
            },
            Self::Float(v) => Self::Float(-v),
            Self::Decimal(v) => Self::Decimal(-v),
        };
        self.add(negated)
    }

    /// Divide an accumulated total by a row count. Integer totals produce a
    /// decimal so averages keep their fraction.
    pub fn divide_by_count(self, count: u64) -> Option<Self> {
        if count == 0 {
            return None;
        }
        match self {
            Self::Float(v) => Some(Self::Float(v / count as f64)),
            other => other
                .to_decimal()
                .and_then(|d| d.checked_div(Decimal::from(count)))
                .map(Self::Decimal),
        }
    }

    pub fn compare(self, other: Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(&b)),
            (Self::Float(_), _) | (_, Self::Float(_)) => self.to_f64().partial_cmp(&other.to_f64()),
            _ => match (self.to_decimal(), other.to_decimal()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => self.to_f64().partial_cmp(&other.to_f64()),
            },
        }
    }
}
