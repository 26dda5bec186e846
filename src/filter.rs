//! Report filters.
//!
//! A filter is declared once on the report and interpreted by the source it
//! belongs to: query filters and column transforms by the database source,
//! delegated, post, and report filters by the merge source. A filter with a
//! widget receives the cleaned user input stored under the filter's name.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::database::{Condition, Entity};
use crate::row::Row;
use crate::source::{RunContext, SourceKind};
use crate::value::Value;
use crate::widget::Widget;

/// Builds a SQL condition, or `None` for no filtering.
pub type QueryFn = Arc<dyn Fn(&Entity<'_>, Option<&Value>) -> Option<Condition> + Send + Sync>;

/// Rewrites a column's SQL expression.
pub type TransformFn = Arc<dyn Fn(&str, Option<&Value>) -> String + Send + Sync>;

/// Decides whether a merged row is kept.
pub type PostFn = Arc<dyn Fn(&Row, Option<&Value>) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum FilterKind {
    /// A WHERE condition on the report's database table.
    Query(QueryFn),
    /// Rewrites the named columns wherever the database source uses them.
    Transform(TransformFn),
    /// Shows a widget whose input is handed down to merged sub-reports.
    Delegated,
    /// Drops merged rows the predicate rejects.
    Post(PostFn),
    /// Runs the named sub-report only when the widget input is truthy.
    Report(String),
}

impl fmt::Debug for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query(_) => f.write_str("Query"),
            Self::Transform(_) => f.write_str("Transform"),
            Self::Delegated => f.write_str("Delegated"),
            Self::Post(_) => f.write_str("Post"),
            Self::Report(name) => f.debug_tuple("Report").field(name).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub kind: FilterKind,
    /// Columns the filter is scoped to; `None` applies report-wide.
    pub columns: Option<BTreeSet<String>>,
    pub widget: Option<Widget>,
}

impl Filter {
    fn new(kind: FilterKind) -> Self {
        Self {
            kind,
            columns: None,
            widget: None,
        }
    }

    pub fn query<F>(condition: F) -> Self
    where
        F: Fn(&Entity<'_>, Option<&Value>) -> Option<Condition> + Send + Sync + 'static,
    {
        Self::new(FilterKind::Query(Arc::new(condition)))
    }

    /// A column transform. The column list must not be empty.
    pub fn transform<F, I, S>(transform: F, columns: I) -> Self
    where
        F: Fn(&str, Option<&Value>) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(FilterKind::Transform(Arc::new(transform))).with_columns(columns)
    }

    pub fn delegated(widget: Widget) -> Self {
        Self::new(FilterKind::Delegated).with_widget(widget)
    }

    pub fn post<F>(predicate: F) -> Self
    where
        F: Fn(&Row, Option<&Value>) -> bool + Send + Sync + 'static,
    {
        Self::new(FilterKind::Post(Arc::new(predicate)))
    }

    pub fn report(sub_report: impl Into<String>, widget: Widget) -> Self {
        Self::new(FilterKind::Report(sub_report.into())).with_widget(widget)
    }

    pub fn with_widget(mut self, widget: Widget) -> Self {
        self.widget = Some(widget);
        self
    }

    /// Scopes the filter to these columns. An empty list means report-wide.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: BTreeSet<String> = columns.into_iter().map(Into::into).collect();
        self.columns = (!columns.is_empty()).then_some(columns);
        self
    }

    /// The source that interprets this filter.
    pub fn source_kind(&self) -> SourceKind {
        match self.kind {
            FilterKind::Query(_) | FilterKind::Transform(_) => SourceKind::Database,
            FilterKind::Delegated | FilterKind::Post(_) | FilterKind::Report(_) => {
                SourceKind::Merge
            }
        }
    }

    pub fn applies_to(&self, column: &str) -> bool {
        self.columns.as_ref().is_some_and(|c| c.contains(column))
    }

    /// The cleaned input for this filter's widget, if it has one.
    pub fn user_input<'a>(&self, name: &str, ctx: &'a RunContext) -> Option<&'a Value> {
        self.widget.as_ref().and_then(|_| ctx.input(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_empty_columns_means_report_wide() {
        let filter = Filter::post(|_, _| true).with_columns(Vec::<String>::new());
        assert!(filter.columns.is_none());
        let filter = Filter::transform(|c, _| c.to_string(), ["a", "b"]);
        assert!(filter.applies_to("a"));
        assert!(!filter.applies_to("c"));
    }

    #[test]
    fn test_source_kind() {
        assert_eq!(Filter::query(|_, _| None).source_kind(), SourceKind::Database);
        assert_eq!(
            Filter::report("sub", Widget::checkbox()).source_kind(),
            SourceKind::Merge
        );
    }

    #[test]
    fn test_user_input_requires_widget() {
        let mut clean = BTreeMap::new();
        clean.insert("min".to_string(), Some(Value::Int(3)));
        let ctx = RunContext::new("r", ("r".into(), "i".into()), clean, BTreeMap::new());
        let bare = Filter::post(|_, _| true);
        assert_eq!(bare.user_input("min", &ctx), None);
        let widgeted = bare.with_widget(Widget::text());
        assert_eq!(widgeted.user_input("min", &ctx), Some(&Value::Int(3)));
    }
}
