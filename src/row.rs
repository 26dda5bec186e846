//! Row keys and row mappings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ArithmeticError;
use crate::value::Value;

/// Compound row key: one scalar per key range, in declaration order.
///
/// Keys compare lexicographically. `None` components (sources may group on
/// a nullable column) sort before any value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub Vec<Option<Value>>);

impl Key {
    pub fn new(parts: Vec<Option<Value>>) -> Self {
        Self(parts)
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![Some(value.into())])
    }

    pub fn parts(&self) -> &[Option<Value>] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match part {
                Some(v) => write!(f, "{v}")?,
                None => f.write_str("None")?,
            }
        }
        f.write_str(")")
    }
}

/// Mapping of column name to cell value.
///
/// Used both for partial rows emitted by a source and for complete report
/// rows, where every declared column is present (possibly `None`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Option<Value>>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// A row holding every name with no value.
    pub fn template<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self(names.into_iter().map(|n| (n.to_string(), None)).collect())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, Some(value.into()));
        self
    }

    pub fn set(&mut self, name: &str, value: Option<Value>) {
        self.0.insert(name.to_string(), value);
    }

    /// The cell value, `None` when absent or empty.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).and_then(Option::as_ref)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// The cell as an arithmetic operand.
    ///
    /// Missing and non-numeric cells are type errors, so a derived formula
    /// over them evaluates to no value rather than failing the row.
    pub fn num(&self, name: &str) -> Result<Value, ArithmeticError> {
        match self.get(name) {
            Some(v) if v.is_numeric() => Ok(v.clone()),
            _ => Err(ArithmeticError::Type),
        }
    }

    /// Overlays `other` onto this row field by field.
    pub fn merge(&mut self, other: Row) {
        self.0.extend(other.0);
    }

    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.0.get_mut(name).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Option<Value>)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Option<Value>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Row {
    type Item = (String, Option<Value>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Option<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A keyed partial row as emitted by sources.
pub type KeyedRow = (Key, Row);
