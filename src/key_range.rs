//! Key ranges: the guaranteed keyspace of a report.
//!
//! Every key a key range yields produces a row in the output, even if no
//! source has data for it. Key ranges are informative rather than
//! restrictive: sources may still add rows for keys outside the range.

use std::rc::Rc;

use chrono::{Months, NaiveDate};

use crate::database::TableKeyRange;
use crate::error::{ReportError, ReportResult};
use crate::row::{Key, KeyedRow, Row};
use crate::source::RunContext;
use crate::value::{epoch_days, month_start, Value};

/// Lazily produced key values for one key column.
pub type KeyValues<'a> = Box<dyn Iterator<Item = Value> + 'a>;

/// A range bound: a literal date or the name of a date input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateBound {
    Date(NaiveDate),
    Input(String),
}

impl DateBound {
    fn resolve(&self, ctx: &RunContext) -> ReportResult<NaiveDate> {
        match self {
            Self::Date(date) => Ok(*date),
            Self::Input(name) => {
                let value = ctx
                    .input(name)
                    .ok_or_else(|| ReportError::MissingInput(name.clone()))?;
                value.as_date().ok_or_else(|| ReportError::InputType {
                    name: name.clone(),
                    expected: "a date",
                })
            }
        }
    }
}

impl From<NaiveDate> for DateBound {
    fn from(date: NaiveDate) -> Self {
        Self::Date(date)
    }
}

impl From<&str> for DateBound {
    fn from(name: &str) -> Self {
        Self::Input(name.to_string())
    }
}

/// The keyspace for one key column.
#[derive(Clone)]
pub enum KeyRange {
    /// No guaranteed keys; rows are whatever the sources return.
    Source,
    /// One key per day, as whole days since the Unix epoch.
    Epoch { start: DateBound, end: DateBound },
    /// One key per month, as the first date of the month.
    Month { start: DateBound, end: DateBound },
    /// Every value of a fixed collection, in key order.
    Iterable(Vec<Value>),
    /// Every primary key of a database table.
    Table(TableKeyRange),
}

impl KeyRange {
    pub fn epoch(start: impl Into<DateBound>, end: impl Into<DateBound>) -> Self {
        Self::Epoch {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn month(start: impl Into<DateBound>, end: impl Into<DateBound>) -> Self {
        Self::Month {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Keys from a collection, sorted into key order.
    pub fn iterable<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        let mut values: Vec<Value> = values.into_iter().map(Into::into).collect();
        values.sort();
        Self::Iterable(values)
    }

    /// Keys from a collection the caller guarantees is already sorted.
    ///
    /// The order is not re-verified; unsorted input corrupts the merge.
    pub fn presorted<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::Iterable(values.into_iter().map(Into::into).collect())
    }

    /// Yields this range's keys in non-decreasing order.
    ///
    /// Bound resolution and ordering errors are raised here, before any key
    /// is produced.
    pub fn get_row_keys<'a>(&'a self, ctx: &RunContext) -> ReportResult<KeyValues<'a>> {
        match self {
            Self::Source => Ok(Box::new(std::iter::empty())),
            Self::Epoch { start, end } => {
                let (start, end) = resolve_bounds(start, end, ctx)?;
                Ok(Box::new(
                    (epoch_days(start)..=epoch_days(end)).map(Value::Int),
                ))
            }
            Self::Month { start, end } => {
                let (start, end) = resolve_bounds(start, end, ctx)?;
                let months = std::iter::successors(Some(month_start(start)), |month| {
                    month.checked_add_months(Months::new(1))
                })
                .take_while(move |month| *month <= end)
                .map(Value::Date);
                Ok(Box::new(months))
            }
            Self::Iterable(values) => Ok(Box::new(values.iter().cloned())),
            Self::Table(table) => Ok(Box::new(table.keys(ctx)?.into_iter())),
        }
    }
}

impl std::fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => f.write_str("Source"),
            Self::Epoch { start, end } => f
                .debug_struct("Epoch")
                .field("start", start)
                .field("end", end)
                .finish(),
            Self::Month { start, end } => f
                .debug_struct("Month")
                .field("start", start)
                .field("end", end)
                .finish(),
            Self::Iterable(values) => f.debug_tuple("Iterable").field(&values.len()).finish(),
            Self::Table(table) => f.debug_tuple("Table").field(&table.table()).finish(),
        }
    }
}

fn resolve_bounds(
    start: &DateBound,
    end: &DateBound,
    ctx: &RunContext,
) -> ReportResult<(NaiveDate, NaiveDate)> {
    let start = start.resolve(ctx)?;
    let end = end.resolve(ctx)?;
    if start > end {
        return Err(ReportError::KeyRangeOrder {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok((start, end))
}

/// Key rows for a (possibly compound) key: the Cartesian product of every
/// key range, in lexicographic key order.
///
/// Each key row holds only the key columns. The first range stays lazy; the
/// remaining ranges are collected so they can be replayed per outer key.
pub fn key_rows<'a>(
    keys: &'a [(String, KeyRange)],
    ctx: &RunContext,
) -> ReportResult<Box<dyn Iterator<Item = KeyedRow> + 'a>> {
    let Some(((first_name, first), rest)) = keys.split_first() else {
        return Ok(Box::new(std::iter::empty()));
    };

    let mut inner: Vec<Vec<Value>> = vec![Vec::new()];
    for (_, range) in rest {
        let values: Vec<Value> = range.get_row_keys(ctx)?.collect();
        inner = inner
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |value| {
                    let mut combo = prefix.clone();
                    combo.push(value.clone());
                    combo
                })
            })
            .collect();
    }
    let inner = Rc::new(inner);
    let names: Rc<Vec<&'a str>> = Rc::new(
        std::iter::once(first_name.as_str())
            .chain(rest.iter().map(|(name, _)| name.as_str()))
            .collect(),
    );

    let rows = first.get_row_keys(ctx)?.flat_map(move |head| {
        let inner = Rc::clone(&inner);
        let names = Rc::clone(&names);
        (0..inner.len()).map(move |i| {
            let parts: Vec<Value> = std::iter::once(head.clone())
                .chain(inner[i].iter().cloned())
                .collect();
            let row: Row = names
                .iter()
                .zip(&parts)
                .map(|(name, value)| (name.to_string(), Some(value.clone())))
                .collect();
            (Key::new(parts.into_iter().map(Some).collect()), row)
        })
    });
    Ok(Box::new(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ctx_with(inputs: &[(&str, Option<Value>)]) -> RunContext {
        let clean: BTreeMap<_, _> = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        RunContext::new("test", ("test".into(), "id".into()), clean, BTreeMap::new())
    }

    #[test]
    fn test_epoch_range_yields_days() {
        let range = KeyRange::epoch(date(2010, 1, 31), date(2010, 2, 1));
        let keys: Vec<_> = range.get_row_keys(&ctx_with(&[])).unwrap().collect();
        assert_eq!(keys, vec![Value::Int(14640), Value::Int(14641)]);
    }

    #[test]
    fn test_epoch_range_resolves_inputs() {
        let ctx = ctx_with(&[
            ("start", Some(Value::Date(date(2011, 1, 1)))),
            ("end", Some(Value::Date(date(2011, 1, 3)))),
        ]);
        let range = KeyRange::epoch("start", "end");
        assert_eq!(range.get_row_keys(&ctx).unwrap().count(), 3);
    }

    #[test]
    fn test_start_after_end_is_an_error() {
        let range = KeyRange::epoch(date(2010, 2, 1), date(2010, 1, 31));
        assert!(matches!(
            range.get_row_keys(&ctx_with(&[])),
            Err(ReportError::KeyRangeOrder { .. })
        ));
        let range = KeyRange::month(date(2010, 3, 1), date(2010, 2, 27));
        assert!(matches!(
            range.get_row_keys(&ctx_with(&[])),
            Err(ReportError::KeyRangeOrder { .. })
        ));
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let range = KeyRange::epoch("start", date(2010, 1, 1));
        assert!(matches!(
            range.get_row_keys(&ctx_with(&[])),
            Err(ReportError::MissingInput(name)) if name == "start"
        ));
        let ctx = ctx_with(&[("start", Some(Value::Int(3)))]);
        assert!(matches!(
            range.get_row_keys(&ctx),
            Err(ReportError::InputType { .. })
        ));
    }

    #[test]
    fn test_month_range_starts_at_first_of_month() {
        let range = KeyRange::month(date(2010, 11, 15), date(2011, 2, 1));
        let keys: Vec<_> = range.get_row_keys(&ctx_with(&[])).unwrap().collect();
        assert_eq!(
            keys,
            vec![
                Value::Date(date(2010, 11, 1)),
                Value::Date(date(2010, 12, 1)),
                Value::Date(date(2011, 1, 1)),
                Value::Date(date(2011, 2, 1)),
            ]
        );
    }

    #[test]
    fn test_iterable_range_sorts_unless_presorted() {
        let ctx = ctx_with(&[]);
        let sorted = KeyRange::iterable([3, 1, 2]);
        let keys: Vec<_> = sorted.get_row_keys(&ctx).unwrap().collect();
        assert_eq!(keys, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

        let trusted = KeyRange::presorted([3, 1]);
        let keys: Vec<_> = trusted.get_row_keys(&ctx).unwrap().collect();
        assert_eq!(keys, vec![Value::Int(3), Value::Int(1)]);
    }

    #[test]
    fn test_compound_keys_are_a_product() {
        let keys = vec![
            ("a".to_string(), KeyRange::iterable([2, 1])),
            ("b".to_string(), KeyRange::iterable(["x", "y"])),
        ];
        let ctx = ctx_with(&[]);
        let rows: Vec<_> = key_rows(&keys, &ctx).unwrap().collect();
        assert_eq!(rows.len(), 4);
        assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(rows[1].0, Key::new(vec![Some(Value::Int(1)), Some(Value::from("y"))]));
        assert_eq!(rows[1].1.get("b"), Some(&Value::from("y")));
    }

    #[test]
    fn test_source_range_yields_nothing() {
        let keys = vec![("id".to_string(), KeyRange::Source)];
        assert_eq!(key_rows(&keys, &ctx_with(&[])).unwrap().count(), 0);
    }
}
