//! The source abstraction: how a report pulls partial rows from a backend.
//!
//! A report holds exactly one source instance per distinct [`SourceKind`]
//! referenced by its columns. Every source sees the whole definition and
//! picks out the columns, keys and filters that apply to it.
//!
//! The built-in sources with no external collaborator live here:
//!
//! - [`KeySource`] echoes key values into key columns.
//! - [`StaticSource`] writes a constant into every row.
//! - [`DerivedSource`] computes cells from the other cells of a merged row.

use std::collections::BTreeMap;
use std::fmt;
use std::iter;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::cache::ReportCache;
use crate::column::{ColumnKind, DeriveFn};
use crate::error::{ArithmeticError, ReportError, ReportResult};
use crate::report::ReportDefinition;
use crate::row::{KeyedRow, Row};
use crate::stream::KeyedStream;
use crate::value::Value;

/// Lazily produced key rows handed to each source.
pub type KeyRows<'a> = Box<dyn Iterator<Item = KeyedRow> + 'a>;

/// Builds a user-defined source for a report definition.
pub type SourceFactory =
    Arc<dyn Fn(&ReportDefinition) -> ReportResult<Box<dyn Source>> + Send + Sync>;

/// Identifies which source owns a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Key,
    Static,
    Derived,
    Database,
    Merge,
    /// A source registered on the definition under this name.
    Custom(&'static str),
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key => f.write_str("key"),
            Self::Static => f.write_str("static"),
            Self::Derived => f.write_str("derived"),
            Self::Database => f.write_str("database"),
            Self::Merge => f.write_str("merge"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Per-run state shared with sources and key ranges.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub code_name: String,
    pub report_id: String,
    pub instance_id: String,
    clean_inputs: BTreeMap<String, Option<Value>>,
    raw_inputs: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(
        code_name: impl Into<String>,
        (report_id, instance_id): (String, String),
        clean_inputs: BTreeMap<String, Option<Value>>,
        raw_inputs: BTreeMap<String, String>,
    ) -> Self {
        Self {
            code_name: code_name.into(),
            report_id,
            instance_id,
            clean_inputs,
            raw_inputs,
        }
    }

    /// The cleaned input for a filter, `None` if absent or left blank.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.clean_inputs.get(name).and_then(Option::as_ref)
    }

    /// Whether a filter with this name produced a cleaned input at all.
    pub fn has_input(&self, name: &str) -> bool {
        self.clean_inputs.contains_key(name)
    }

    /// The cleaned input, failing if the filter is not known.
    pub fn require_input(&self, name: &str) -> ReportResult<&Value> {
        self.input(name)
            .ok_or_else(|| ReportError::MissingInput(name.to_string()))
    }

    pub fn clean_inputs(&self) -> &BTreeMap<String, Option<Value>> {
        &self.clean_inputs
    }

    pub fn raw_inputs(&self) -> &BTreeMap<String, String> {
        &self.raw_inputs
    }
}

/// A pluggable row backend.
///
/// `get_rows` must yield rows in non-decreasing key order. A source may skip
/// keys from the key range or add keys outside it. `post_process` runs once
/// per merged row, in source order, and must not rely on another source's
/// `post_process` having run.
pub trait Source: Send {
    fn kind(&self) -> SourceKind;

    /// Setup before any rows are pulled. Called once per run.
    fn pre_process(&mut self, _ctx: &RunContext) -> ReportResult<()> {
        Ok(())
    }

    fn get_rows<'a>(
        &'a self,
        _key_rows: KeyRows<'a>,
        _ctx: &'a RunContext,
    ) -> ReportResult<KeyedStream<'a, Row>> {
        Ok(Box::new(iter::empty()))
    }

    fn post_process(&self, row: Row, _ctx: &RunContext) -> Row {
        row
    }
}

/// Instantiates the source that owns columns of `kind`.
pub(crate) fn instantiate(
    kind: SourceKind,
    definition: &ReportDefinition,
    cache: &Arc<dyn ReportCache>,
) -> ReportResult<Box<dyn Source>> {
    let source: Box<dyn Source> = match kind {
        SourceKind::Key => Box::new(KeySource::new(definition)?),
        SourceKind::Static => Box::new(StaticSource::new(definition)),
        SourceKind::Derived => Box::new(DerivedSource::new(definition)),
        SourceKind::Database => Box::new(crate::database::DatabaseSource::new(definition)?),
        SourceKind::Merge => Box::new(crate::merge::MergeSource::new(definition, cache)?),
        SourceKind::Custom(name) => {
            let factory = definition.custom_source(name).ok_or_else(|| {
                ReportError::config(format!("no source registered under {name:?}"))
            })?;
            factory(definition)?
        }
    };
    tracing::debug!(report = %definition.code_name(), source = %kind, "instantiated source");
    Ok(source)
}

// ============================================================================
// Key echo
// ============================================================================

/// Copies key values from the key rows into key columns.
pub struct KeySource {
    columns: Vec<String>,
}

impl KeySource {
    pub fn new(definition: &ReportDefinition) -> ReportResult<Self> {
        let columns: Vec<String> = definition
            .columns_of(SourceKind::Key)
            .map(|(name, _)| name.to_string())
            .collect();
        if let Some(missing) = columns
            .iter()
            .find(|name| !definition.key_names().any(|key| key == name.as_str()))
        {
            return Err(ReportError::config(format!(
                "key column {missing} does not name a report key"
            )));
        }
        Ok(Self { columns })
    }
}

impl Source for KeySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Key
    }

    fn get_rows<'a>(
        &'a self,
        key_rows: KeyRows<'a>,
        _ctx: &'a RunContext,
    ) -> ReportResult<KeyedStream<'a, Row>> {
        Ok(Box::new(key_rows.map(move |(key, key_row)| {
            let row = self
                .columns
                .iter()
                .map(|name| (name.clone(), key_row.get(name).cloned()))
                .collect();
            Ok((key, row))
        })))
    }
}

// ============================================================================
// Static values
// ============================================================================

/// Fills every row with each static column's constant.
pub struct StaticSource {
    values: Vec<(String, Value)>,
}

impl StaticSource {
    pub fn new(definition: &ReportDefinition) -> Self {
        let values = definition
            .columns_of(SourceKind::Static)
            .filter_map(|(name, column)| match &column.kind {
                ColumnKind::Static(value) => Some((name.to_string(), value.clone())),
                _ => None,
            })
            .collect();
        Self { values }
    }
}

impl Source for StaticSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn post_process(&self, mut row: Row, _ctx: &RunContext) -> Row {
        for (name, value) in &self.values {
            row.set(name, Some(value.clone()));
        }
        row
    }
}

// ============================================================================
// Derived values
// ============================================================================

/// Evaluates a derive formula, absorbing arithmetic failures.
///
/// Missing or non-numeric operands give no value. Division by zero gives
/// a decimal zero.
pub fn evaluate_derived(derive: &DeriveFn, row: &Row) -> Option<Value> {
    match derive(row) {
        Ok(value) => Some(value),
        Err(ArithmeticError::Type) => None,
        Err(ArithmeticError::DivisionByZero) => Some(Value::Decimal(Decimal::new(0, 2))),
    }
}

/// Computes derived columns over the fully merged row.
pub struct DerivedSource {
    columns: Vec<(String, DeriveFn)>,
}

impl DerivedSource {
    pub fn new(definition: &ReportDefinition) -> Self {
        let columns = definition
            .columns_of(SourceKind::Derived)
            .filter_map(|(name, column)| match &column.kind {
                ColumnKind::Derived(derive) => Some((name.to_string(), Arc::clone(derive))),
                _ => None,
            })
            .collect();
        Self { columns }
    }
}

impl Source for DerivedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Derived
    }

    fn post_process(&self, mut row: Row, _ctx: &RunContext) -> Row {
        for (name, derive) in &self.columns {
            let value = evaluate_derived(derive, &row);
            row.set(name, value);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratio() -> DeriveFn {
        Arc::new(|row: &Row| row.num("net")?.div(&row.num("gross")?))
    }

    #[test]
    fn test_derived_type_error_is_none() {
        let row = Row::template(["net", "gross"]).with("net", 5);
        assert_eq!(evaluate_derived(&ratio(), &row), None);
    }

    #[test]
    fn test_derived_division_by_zero_is_zero_sentinel() {
        let row = Row::new().with("net", 5).with("gross", 0);
        let value = evaluate_derived(&ratio(), &row).unwrap();
        assert_eq!(value, Value::Decimal(Decimal::new(0, 2)));
        assert_eq!(value.to_string(), "0.00");
    }

    #[test]
    fn test_derived_value() {
        let row = Row::new().with("net", 1).with("gross", 4);
        assert_eq!(
            evaluate_derived(&ratio(), &row),
            Some(Value::Decimal(Decimal::new(25, 2)))
        );
    }

    #[test]
    fn test_context_inputs() {
        let mut clean = BTreeMap::new();
        clean.insert("start".to_string(), Some(Value::Int(3)));
        clean.insert("blank".to_string(), None);
        let ctx = RunContext::new(
            "report",
            ("report".into(), "abc".into()),
            clean,
            BTreeMap::new(),
        );
        assert_eq!(ctx.input("start"), Some(&Value::Int(3)));
        assert!(ctx.has_input("blank"));
        assert!(ctx.input("blank").is_none());
        assert!(matches!(
            ctx.require_input("missing"),
            Err(ReportError::MissingInput(name)) if name == "missing"
        ));
    }
}
