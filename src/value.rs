//! Cell values.
//!
//! A report cell is an `Option<Value>`: `None` means the column has no data
//! for that row. Values are totally ordered so that they can be used as row
//! keys: numeric variants compare by magnitude regardless of representation,
//! and everything else orders by variant first.

use std::cmp::Ordering;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ArithmeticError;

/// A scalar cell value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Str(String),
    Date(NaiveDate),
    List(Vec<Value>),
}

impl Value {
    /// True for integer, float, and decimal values.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_) | Self::Decimal(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Decimal(d) => !d.is_zero(),
            Self::Str(s) => !s.is_empty(),
            Self::Date(_) => true,
            Self::List(items) => !items.is_empty(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int(i) => Some(Decimal::from(*i)),
            Self::Float(f) => Decimal::from_f64(*f),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn add(&self, other: &Self) -> Result<Self, ArithmeticError> {
        match Operands::of(self, other)? {
            Operands::Int(a, b) => Ok(a
                .checked_add(b)
                .map_or_else(|| Self::Decimal(Decimal::from(a) + Decimal::from(b)), Self::Int)),
            Operands::Float(a, b) => Ok(Self::Float(a + b)),
            Operands::Decimal(a, b) => a
                .checked_add(b)
                .map(Self::Decimal)
                .ok_or(ArithmeticError::Type),
        }
    }

    pub fn sub(&self, other: &Self) -> Result<Self, ArithmeticError> {
        match Operands::of(self, other)? {
            Operands::Int(a, b) => Ok(a
                .checked_sub(b)
                .map_or_else(|| Self::Decimal(Decimal::from(a) - Decimal::from(b)), Self::Int)),
            Operands::Float(a, b) => Ok(Self::Float(a - b)),
            Operands::Decimal(a, b) => a
                .checked_sub(b)
                .map(Self::Decimal)
                .ok_or(ArithmeticError::Type),
        }
    }

    pub fn mul(&self, other: &Self) -> Result<Self, ArithmeticError> {
        match Operands::of(self, other)? {
            Operands::Int(a, b) => match a.checked_mul(b) {
                Some(v) => Ok(Self::Int(v)),
                None => Decimal::from(a)
                    .checked_mul(Decimal::from(b))
                    .map(Self::Decimal)
                    .ok_or(ArithmeticError::Type),
            },
            Operands::Float(a, b) => Ok(Self::Float(a * b)),
            Operands::Decimal(a, b) => a
                .checked_mul(b)
                .map(Self::Decimal)
                .ok_or(ArithmeticError::Type),
        }
    }

    /// Divides two values. Integer division is exact and yields a decimal.
    pub fn div(&self, other: &Self) -> Result<Self, ArithmeticError> {
        match Operands::of(self, other)? {
            Operands::Float(a, b) => {
                if b == 0.0 {
                    return Err(ArithmeticError::DivisionByZero);
                }
                Ok(Self::Float(a / b))
            }
            Operands::Int(a, b) => divide_decimal(Decimal::from(a), Decimal::from(b)),
            Operands::Decimal(a, b) => divide_decimal(a, b),
        }
    }

    /// Projection stored in a cache column for ordering.
    pub fn to_sql(&self) -> rusqlite::types::Value {
        use rusqlite::types::Value as Sql;
        match self {
            Self::Bool(b) => Sql::Integer(i64::from(*b)),
            Self::Int(i) => Sql::Integer(*i),
            Self::Float(f) => Sql::Real(*f),
            Self::Decimal(d) => d.to_f64().map_or(Sql::Null, Sql::Real),
            Self::Str(s) => Sql::Text(s.clone()),
            Self::Date(d) => Sql::Integer(epoch_days(*d)),
            Self::List(_) => Sql::Text(self.to_string()),
        }
    }

    /// Plain JSON rendering for raw output. Decimals stay exact as strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::Str(s) => Json::String(s.clone()),
            Self::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Self::List(items) => Json::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) | Self::Float(_) | Self::Decimal(_) => 1,
            Self::Str(_) => 2,
            Self::Date(_) => 3,
            Self::List(_) => 4,
        }
    }
}

/// Numeric operands promoted to a common representation.
enum Operands {
    Int(i64, i64),
    Float(f64, f64),
    Decimal(Decimal, Decimal),
}

impl Operands {
    fn of(a: &Value, b: &Value) -> Result<Self, ArithmeticError> {
        match (a, b) {
            (Value::Int(a), Value::Int(b)) => Ok(Self::Int(*a, *b)),
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                    return Err(ArithmeticError::Type);
                };
                Ok(Self::Float(a, b))
            }
            _ if a.is_numeric() && b.is_numeric() => {
                let (Some(a), Some(b)) = (a.as_decimal(), b.as_decimal()) else {
                    return Err(ArithmeticError::Type);
                };
                Ok(Self::Decimal(a, b))
            }
            _ => Err(ArithmeticError::Type),
        }
    }
}

fn divide_decimal(a: Decimal, b: Decimal) -> Result<Value, ArithmeticError> {
    if b.is_zero() {
        return Err(ArithmeticError::DivisionByZero);
    }
    a.checked_div(b)
        .map(|d| Value::Decimal(d.normalize()))
        .ok_or(ArithmeticError::Type)
}

fn cmp_numeric(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        _ => a.as_decimal().cmp(&b.as_decimal()),
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => cmp_numeric(a, b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Str(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

/// The Unix epoch as a calendar date.
pub fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Whole days since 1970-01-01.
pub fn epoch_days(date: NaiveDate) -> i64 {
    date.signed_duration_since(epoch()).num_days()
}

/// Inverse of [`epoch_days`].
pub fn from_epoch_days(days: i64) -> Option<NaiveDate> {
    epoch().checked_add_signed(chrono::Duration::try_days(days)?)
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Value {
        Value::Decimal(s.parse().unwrap())
    }

    #[test]
    fn test_numeric_values_compare_across_representations() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_eq!(Value::Int(2), dec("2.00"));
        assert!(Value::Int(1) < dec("1.5"));
        assert!(Value::Float(0.5) < Value::Int(1));
    }

    #[test]
    fn test_variants_order_by_rank() {
        assert!(Value::Bool(true) < Value::Int(-5));
        assert!(Value::Int(1_000) < Value::from("a"));
        assert!(Value::from("zzz") < Value::Date(epoch()));
    }

    #[test]
    fn test_int_division_is_exact_decimal() {
        let result = Value::Int(1).div(&Value::Int(4)).unwrap();
        assert_eq!(result, dec("0.25"));
        assert!(matches!(result, Value::Decimal(_)));
    }

    #[test]
    fn test_division_by_zero_is_reported() {
        assert_eq!(
            Value::Int(1).div(&Value::Int(0)),
            Err(ArithmeticError::DivisionByZero)
        );
        assert_eq!(
            Value::Float(1.0).div(&Value::Float(0.0)),
            Err(ArithmeticError::DivisionByZero)
        );
    }

    #[test]
    fn test_non_numeric_operand_is_type_error() {
        assert_eq!(
            Value::from("x").add(&Value::Int(1)),
            Err(ArithmeticError::Type)
        );
        assert_eq!(
            Value::Bool(true).mul(&Value::Int(1)),
            Err(ArithmeticError::Type)
        );
    }

    #[test]
    fn test_mixed_addition_promotes() {
        assert_eq!(Value::Int(1).add(&dec("0.5")).unwrap(), dec("1.5"));
        assert!(matches!(
            Value::Int(1).add(&Value::Float(0.5)).unwrap(),
            Value::Float(_)
        ));
        assert!(matches!(
            Value::Int(i64::MAX).add(&Value::Int(1)).unwrap(),
            Value::Decimal(_)
        ));
    }

    #[test]
    fn test_epoch_days() {
        let day = NaiveDate::from_ymd_opt(2010, 1, 31).unwrap();
        assert_eq!(epoch_days(day), 14640);
        assert_eq!(from_epoch_days(14641), NaiveDate::from_ymd_opt(2010, 2, 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::from("a")]).to_string(),
            "[1, a]"
        );
        assert_eq!(
            Value::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()).to_string(),
            "2024-03-09"
        );
    }
}
