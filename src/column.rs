//! Report columns and the footer accumulation protocol.

use std::fmt;
use std::sync::Arc;

use crate::database::DatabaseColumn;
use crate::error::ArithmeticError;
use crate::format::Format;
use crate::merge::MergeColumn;
use crate::row::Row;
use crate::source::{evaluate_derived, SourceKind};
use crate::value::Value;

/// Formula for a derived column, evaluated against a merged row.
pub type DeriveFn = Arc<dyn Fn(&Row) -> Result<Value, ArithmeticError> + Send + Sync>;

/// What a column holds and which source produces it.
#[derive(Clone)]
pub enum ColumnKind {
    /// The value of the same-named report key.
    Key,
    /// A constant.
    Static(Value),
    /// Computed from the other cells of the row.
    Derived(DeriveFn),
    Database(DatabaseColumn),
    Merge(MergeColumn),
    /// Filled by the user-defined source registered under this name.
    Custom(&'static str),
}

impl fmt::Debug for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key => f.write_str("Key"),
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Derived(_) => f.write_str("Derived"),
            Self::Database(column) => f.debug_tuple("Database").field(column).finish(),
            Self::Merge(column) => f.debug_tuple("Merge").field(column).finish(),
            Self::Custom(name) => f.debug_tuple("Custom").field(name).finish(),
        }
    }
}

/// A named slot in a report row.
#[derive(Debug, Clone)]
pub struct Column {
    pub kind: ColumnKind,
    pub format: Format,
    /// Whether a footer total is computed and shown.
    pub footer: bool,
}

impl Column {
    pub fn new(kind: ColumnKind) -> Self {
        Self {
            kind,
            format: Format::hidden(),
            footer: true,
        }
    }

    /// Echoes the key column with the same name.
    pub fn key() -> Self {
        Self::new(ColumnKind::Key)
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Self::new(ColumnKind::Static(value.into()))
    }

    /// A column computed from other cells.
    ///
    /// Its footer re-runs `derive` over the footer totals rather than
    /// summing the per-row results.
    pub fn derived<F>(derive: F) -> Self
    where
        F: Fn(&Row) -> Result<Value, ArithmeticError> + Send + Sync + 'static,
    {
        Self::new(ColumnKind::Derived(Arc::new(derive)))
    }

    pub fn custom(source: &'static str) -> Self {
        Self::new(ColumnKind::Custom(source))
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_footer(mut self, footer: bool) -> Self {
        self.footer = footer;
        self
    }

    pub fn source_kind(&self) -> SourceKind {
        match &self.kind {
            ColumnKind::Key => SourceKind::Key,
            ColumnKind::Static(_) => SourceKind::Static,
            ColumnKind::Derived(_) => SourceKind::Derived,
            ColumnKind::Database(_) => SourceKind::Database,
            ColumnKind::Merge(_) => SourceKind::Merge,
            ColumnKind::Custom(name) => SourceKind::Custom(name),
        }
    }

    pub fn sort_alpha(&self) -> bool {
        self.format.sort_alpha()
    }

    fn accumulates(&self) -> bool {
        if !self.footer {
            return false;
        }
        match &self.kind {
            ColumnKind::Derived(_) => false,
            ColumnKind::Database(column) => column.has_footer(),
            ColumnKind::Merge(column) => column.has_footer(),
            _ => true,
        }
    }

    /// Folds one cell into the running total.
    ///
    /// Numeric cells add up; the first one starts the total. Empty and
    /// non-numeric cells leave the total alone. An addition that overflows
    /// makes the footer ineligible for the rest of the run.
    pub fn increment_footer(&self, total: FooterTotal, cell: Option<&Value>) -> FooterTotal {
        if !self.accumulates() {
            return FooterTotal::Ineligible;
        }
        match (total, cell.filter(|cell| cell.is_numeric())) {
            (FooterTotal::Ineligible, _) => FooterTotal::Ineligible,
            (total, None) => total,
            (FooterTotal::Empty, Some(cell)) => FooterTotal::Running(cell.clone()),
            (FooterTotal::Running(sum), Some(cell)) => match sum.add(cell) {
                Ok(sum) => FooterTotal::Running(sum),
                Err(_) => FooterTotal::Ineligible,
            },
        }
    }

    /// The final footer value.
    ///
    /// `snapshot` holds the finalized footers of every column finalized so
    /// far; derived columns evaluate their formula against it.
    pub fn finalize_footer(&self, total: FooterTotal, snapshot: &Row) -> Option<Value> {
        if !self.footer {
            return None;
        }
        match &self.kind {
            ColumnKind::Derived(derive) => evaluate_derived(derive, snapshot),
            _ => total.into_value(),
        }
    }
}

/// Running state of one column's footer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FooterTotal {
    /// No numeric cell seen yet.
    #[default]
    Empty,
    Running(Value),
    /// The column has no meaningful footer for this run.
    Ineligible,
}

impl FooterTotal {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Running(value) => Some(value),
            Self::Empty | Self::Ineligible => None,
        }
    }
}

/// Per-run footer accumulator for a whole report.
#[derive(Debug, Clone)]
pub struct Footer {
    totals: Vec<FooterTotal>,
}

impl Footer {
    pub fn new(width: usize) -> Self {
        Self {
            totals: vec![FooterTotal::Empty; width],
        }
    }

    pub fn increment(&mut self, columns: &[(String, Column)], row: &Row) {
        for ((name, column), total) in columns.iter().zip(self.totals.iter_mut()) {
            let current = std::mem::take(total);
            *total = column.increment_footer(current, row.get(name));
        }
    }

    /// Finalizes every column.
    ///
    /// Accumulated columns go first so derived footers see all totals, then
    /// derived columns in declaration order, each seeing earlier ones.
    pub fn finalize(self, columns: &[(String, Column)]) -> Row {
        let mut snapshot = Row::template(columns.iter().map(|(name, _)| name.as_str()));
        let mut derived = Vec::new();
        for ((name, column), total) in columns.iter().zip(self.totals) {
            if matches!(column.kind, ColumnKind::Derived(_)) {
                derived.push((name, column, total));
                continue;
            }
            let value = column.finalize_footer(total, &snapshot);
            snapshot.set(name, value);
        }
        for (name, column, total) in derived {
            let value = column.finalize_footer(total, &snapshot);
            snapshot.set(name, value);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sum(column: &Column, cells: &[Option<Value>]) -> Option<Value> {
        let total = cells.iter().fold(FooterTotal::Empty, |total, cell| {
            column.increment_footer(total, cell.as_ref())
        });
        column.finalize_footer(total, &Row::new())
    }

    #[test]
    fn test_sum_footer_ignores_empty_cells() {
        let column = Column::custom("test");
        let cells = [Some(Value::Int(10)), None, Some(Value::Int(5))];
        assert_eq!(sum(&column, &cells), Some(Value::Int(15)));
    }

    #[test]
    fn test_footer_is_order_independent() {
        let column = Column::custom("test");
        let forward = [
            Some(Value::Int(1)),
            Some(Value::Float(2.5)),
            Some(Value::Decimal(Decimal::new(125, 2))),
        ];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(sum(&column, &forward), sum(&column, &backward));
        assert_eq!(sum(&column, &forward), Some(Value::Float(4.75)));
    }

    #[test]
    fn test_non_numeric_cells_are_skipped() {
        let column = Column::custom("test");
        let cells = [Some(Value::Int(3)), Some(Value::from("three")), Some(Value::Int(2))];
        assert_eq!(sum(&column, &cells), Some(Value::Int(5)));

        let leading = [Some(Value::from("x")), Some(Value::Int(5))];
        assert_eq!(sum(&column, &leading), Some(Value::Int(5)));

        let only_text = [Some(Value::from("x")), None];
        assert_eq!(sum(&column, &only_text), None);
    }

    #[test]
    fn test_overflow_disables_footer() {
        let column = Column::custom("test");
        let cells = [
            Some(Value::Decimal(Decimal::MAX)),
            Some(Value::Decimal(Decimal::ONE)),
            Some(Value::Int(2)),
        ];
        assert_eq!(sum(&column, &cells), None);
    }

    #[test]
    fn test_disabled_footer() {
        let column = Column::custom("test").with_footer(false);
        assert_eq!(sum(&column, &[Some(Value::Int(1))]), None);
    }

    #[test]
    fn test_derived_footer_is_ratio_of_totals() {
        let columns = vec![
            ("net".to_string(), Column::custom("test")),
            ("gross".to_string(), Column::custom("test")),
            (
                "margin".to_string(),
                Column::derived(|row| row.num("net")?.div(&row.num("gross")?)),
            ),
        ];
        let mut footer = Footer::new(columns.len());
        // per-row margins are 1/2 and 3/4; their mean would be 0.625
        footer.increment(&columns, &Row::new().with("net", 1).with("gross", 2).with("margin", 0.5));
        footer.increment(&columns, &Row::new().with("net", 3).with("gross", 4).with("margin", 0.75));
        let finalized = footer.finalize(&columns);
        assert_eq!(finalized.get("net"), Some(&Value::Int(4)));
        assert_eq!(finalized.get("gross"), Some(&Value::Int(6)));
        assert_eq!(
            finalized.get("margin").and_then(Value::as_f64).map(|m| (m * 1e4).round()),
            Some(6667.0)
        );
    }
}
