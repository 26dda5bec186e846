//! Merge reports: one report composed from the output of several others.
//!
//! Each sub-report runs through its own cache instance, nested under the
//! parent's instance id. Its cached rows are then read back a page at a time,
//! sorted on the parent's single key, and merged column by column in
//! alphabetical sub-report order.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::{CachedRow, ReportCache, RowQuery, Sort};
use crate::column::{Column, ColumnKind};
use crate::error::{ReportError, ReportResult};
use crate::filter::{Filter, FilterKind};
use crate::report::{Report, ReportDefinition};
use crate::row::{Key, KeyedRow, Row};
use crate::source::{KeyRows, RunContext, Source, SourceKind};
use crate::stream::{KMerge, KeyedStream};
use crate::value::Value;

/// Cached sub-report rows read per query while merging.
pub const MERGE_PAGE_SIZE: usize = 250;

/// Which sub-report columns feed a merge column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeSelector {
    /// Every sub-report column with the merge column's own name.
    SameName,
    /// Every sub-report column with this name.
    Named(String),
    /// Only these `(sub_report, column)` pairs.
    Pairs(Vec<(String, String)>),
}

impl MergeSelector {
    /// Parses selector arguments: none, one bare column name, or
    /// `report.column` pairs.
    pub fn parse(args: &[&str]) -> Self {
        match args {
            [] => Self::SameName,
            [single] if !single.contains('.') => Self::Named(single.to_string()),
            pairs => Self::Pairs(
                pairs
                    .iter()
                    .map(|arg| match arg.rsplit_once('.') {
                        Some((report, column)) => (report.to_string(), column.to_string()),
                        None => (String::new(), arg.to_string()),
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOp {
    First,
    Sum,
    BoolAnd,
    BoolOr,
}

impl MergeOp {
    /// Folds one sub-report value into the merged value.
    pub fn merge(self, current: Option<&Value>, new: Option<&Value>) -> Option<Value> {
        match self {
            Self::First => current.or(new).cloned(),
            Self::Sum => match (current, new) {
                (None, None) => None,
                (None, Some(value)) | (Some(value), None) => Some(value.clone()),
                (Some(a), Some(b)) => a.add(b).ok(),
            },
            Self::BoolAnd => {
                let current = current.map_or(true, Value::is_truthy);
                let new = new.map_or(true, Value::is_truthy);
                Some(Value::Bool(current && new))
            }
            Self::BoolOr => {
                let current = current.is_some_and(Value::is_truthy);
                let new = new.is_some_and(Value::is_truthy);
                Some(Value::Bool(current || new))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeColumn {
    pub selector: MergeSelector,
    pub op: MergeOp,
}

impl MergeColumn {
    /// Boolean merges have no footer.
    pub fn has_footer(&self) -> bool {
        matches!(self.op, MergeOp::First | MergeOp::Sum)
    }

    /// The merged value after folding in one row from `report`.
    ///
    /// Rows the selector does not pick leave the current value as is.
    pub fn merge_report_column(
        &self,
        report: &str,
        column: &str,
        current: Option<&Value>,
        new: &Row,
    ) -> Option<Value> {
        match &self.selector {
            MergeSelector::SameName => self.op.merge(current, new.get(column)),
            MergeSelector::Named(source) if new.contains(source) => {
                self.op.merge(current, new.get(source))
            }
            MergeSelector::Named(_) => current.cloned(),
            MergeSelector::Pairs(pairs) => pairs
                .iter()
                .find(|(r, c)| r == report && new.contains(c))
                .map_or_else(|| current.cloned(), |(_, c)| self.op.merge(current, new.get(c))),
        }
    }
}

fn merge_column(op: MergeOp, args: &[&str]) -> Column {
    Column::new(ColumnKind::Merge(MergeColumn {
        selector: MergeSelector::parse(args),
        op,
    }))
}

/// Keeps the first non-empty value.
pub fn first(args: &[&str]) -> Column {
    merge_column(MergeOp::First, args)
}

pub fn sum(args: &[&str]) -> Column {
    merge_column(MergeOp::Sum, args)
}

/// True unless some sub-report value is false. Empty values count as true.
pub fn bool_and(args: &[&str]) -> Column {
    merge_column(MergeOp::BoolAnd, args)
}

/// True if some sub-report value is true. Empty values count as false.
pub fn bool_or(args: &[&str]) -> Column {
    merge_column(MergeOp::BoolOr, args)
}

// ============================================================================
// Merge source
// ============================================================================

/// A sub-report that ran for this merge, and where its rows are cached.
struct Included {
    name: String,
    report_id: String,
    instance_id: String,
}

pub struct MergeSource {
    key: String,
    columns: Vec<(String, MergeColumn)>,
    filters: Vec<(String, Filter)>,
    reports: Vec<(String, Report)>,
    cache: Arc<dyn ReportCache>,
    /// Sub-reports not excluded by a report filter, in merge order.
    included: Vec<Included>,
}

impl MergeSource {
    pub fn new(definition: &ReportDefinition, cache: &Arc<dyn ReportCache>) -> ReportResult<Self> {
        let keys: Vec<&str> = definition.key_names().collect();
        let [key] = keys.as_slice() else {
            return Err(ReportError::config(
                "merge reports must have exactly one key so sub-report rows sort consistently",
            ));
        };

        let columns: Vec<(String, MergeColumn)> = definition
            .columns_of(SourceKind::Merge)
            .filter_map(|(name, column)| match &column.kind {
                ColumnKind::Merge(merge) => Some((name.to_string(), merge.clone())),
                _ => None,
            })
            .collect();
        let filters: Vec<(String, Filter)> = definition
            .filters()
            .filter(|(_, filter)| filter.source_kind() == SourceKind::Merge)
            .map(|(name, filter)| (name.to_string(), filter.clone()))
            .collect();

        let mut reports = Vec::new();
        for (name, factory) in definition.merged_reports() {
            let report = Report::new_merged(factory(), Arc::clone(cache))?;
            if report.definition().column(key).is_none() {
                return Err(ReportError::config(format!(
                    "sub-report {name} has no column for merge key {key}"
                )));
            }
            reports.push((name.to_string(), report));
        }

        let known: BTreeSet<&str> = reports.iter().map(|(name, _)| name.as_str()).collect();
        for (name, column) in &columns {
            if let MergeSelector::Pairs(pairs) = &column.selector {
                if let Some((report, _)) = pairs.iter().find(|(r, _)| !known.contains(r.as_str())) {
                    return Err(ReportError::config(format!(
                        "merge column {name} names unknown sub-report {report:?}"
                    )));
                }
            }
        }
        for (name, filter) in &filters {
            if let FilterKind::Report(report) = &filter.kind {
                if !known.contains(report.as_str()) {
                    return Err(ReportError::config(format!(
                        "report filter {name} names unknown sub-report {report}"
                    )));
                }
            }
        }

        Ok(Self {
            key: key.to_string(),
            columns,
            filters,
            reports,
            cache: Arc::clone(cache),
            included: Vec::new(),
        })
    }

    fn excluded(&self, ctx: &RunContext) -> BTreeSet<String> {
        self.filters
            .iter()
            .filter_map(|(name, filter)| match &filter.kind {
                FilterKind::Report(report) => {
                    let include = ctx.input(name).is_some_and(Value::is_truthy);
                    (!include).then(|| report.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn passes_post_filters(&self, row: &Row, ctx: &RunContext) -> bool {
        self.filters.iter().all(|(name, filter)| match &filter.kind {
            FilterKind::Post(predicate) => predicate(row, filter.user_input(name, ctx)),
            _ => true,
        })
    }

    fn fold(&self, report: &str, current: &mut Row, new: &Row) {
        for (name, column) in &self.columns {
            let value = column.merge_report_column(report, name, current.get(name), new);
            current.set(name, value);
        }
    }
}

impl Source for MergeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Merge
    }

    /// Runs every included sub-report into the cache. Rows are read back
    /// later, page by page, as the merge pulls them.
    fn pre_process(&mut self, ctx: &RunContext) -> ReportResult<()> {
        let excluded = self.excluded(ctx);
        let (parent_id, parent_instance) = (ctx.report_id.clone(), ctx.instance_id.clone());
        self.included.clear();

        for (name, report) in &mut self.reports {
            let sub_inputs = ctx
                .raw_inputs()
                .iter()
                .map(|(key, value)| (key.replace(&ctx.code_name, report.code_name()), value.clone()))
                .collect();
            let errors = report.clean_user_inputs(&sub_inputs);
            if !errors.is_empty() {
                return Err(ReportError::Validation(errors));
            }
            report.set_unique_id((parent_id.clone(), format!("{parent_instance}::{name}")));

            if excluded.contains(name.as_str()) {
                tracing::debug!(report = %ctx.code_name, sub_report = %name, "sub-report excluded");
                continue;
            }
            if !report.is_report_finished()? {
                tracing::info!(report = %ctx.code_name, sub_report = %name, "running sub-report");
                report.run_report()?;
            }

            let (report_id, instance_id) = report.unique_id();
            self.included.push(Included {
                name: name.clone(),
                report_id,
                instance_id,
            });
        }
        Ok(())
    }

    fn get_rows<'a>(
        &'a self,
        _key_rows: KeyRows<'a>,
        ctx: &'a RunContext,
    ) -> ReportResult<KeyedStream<'a, Row>> {
        let streams: Vec<KeyedStream<'a, Row>> = self
            .included
            .iter()
            .map(move |included| -> KeyedStream<'a, Row> {
                Box::new(SubReportRows::new(
                    self.cache.as_ref(),
                    included,
                    &self.key,
                    MERGE_PAGE_SIZE,
                ))
            })
            .collect();
        Ok(Box::new(MergedRows {
            source: self,
            ctx,
            merge: KMerge::new(streams),
            current: None,
        }))
    }
}

/// One sub-report's cached rows in key order, read a page at a time.
///
/// Keys sort numerically in the cache unless the first page shows text
/// keys, in which case the sort switches to alphabetical. A row arriving
/// out of key order fails the merge rather than splitting a key.
struct SubReportRows<'a> {
    cache: &'a dyn ReportCache,
    report_id: &'a str,
    instance_id: &'a str,
    key: &'a str,
    page_size: usize,
    alpha: Option<bool>,
    offset: usize,
    page: std::vec::IntoIter<CachedRow>,
    last: Option<Key>,
    done: bool,
}

impl<'a> SubReportRows<'a> {
    fn new(cache: &'a dyn ReportCache, included: &'a Included, key: &'a str, page_size: usize) -> Self {
        Self {
            cache,
            report_id: &included.report_id,
            instance_id: &included.instance_id,
            key,
            page_size: page_size.max(1),
            alpha: None,
            offset: 0,
            page: Vec::new().into_iter(),
            last: None,
            done: false,
        }
    }

    fn query(&self, alpha: bool) -> ReportResult<Vec<CachedRow>> {
        let query = RowQuery::new()
            .with_sort(Sort::asc(self.key))
            .with_alpha(alpha)
            .with_offset(self.offset)
            .with_limit(self.page_size);
        Ok(self.cache.instance_rows(self.report_id, self.instance_id, &query)?)
    }

    fn fetch_page(&mut self) -> ReportResult<()> {
        let rows = match self.alpha {
            Some(alpha) => self.query(alpha)?,
            None => {
                let rows = self.query(false)?;
                let alpha = rows
                    .iter()
                    .any(|cached| matches!(cached.row.get(self.key), Some(Value::Str(_) | Value::List(_))));
                self.alpha = Some(alpha);
                if alpha {
                    self.query(true)?
                } else {
                    rows
                }
            }
        };
        self.done = rows.len() < self.page_size;
        self.offset += rows.len();
        self.page = rows.into_iter();
        Ok(())
    }
}

impl Iterator for SubReportRows<'_> {
    type Item = ReportResult<KeyedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cached) = self.page.next() {
                let key = Key::new(vec![cached.row.get(self.key).cloned()]);
                if self.last.as_ref().is_some_and(|last| key < *last) {
                    self.done = true;
                    self.page = Vec::new().into_iter();
                    return Some(Err(ReportError::config(format!(
                        "sub-report rows in {} are not in {} order",
                        self.report_id, self.key
                    ))));
                }
                self.last = Some(key.clone());
                return Some(Ok((key, cached.row)));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Folds sub-report rows sharing a key into one merged row.
struct MergedRows<'a> {
    source: &'a MergeSource,
    ctx: &'a RunContext,
    merge: KMerge<'a, Row>,
    current: Option<KeyedRow>,
}

impl MergedRows<'_> {
    fn template(&self) -> Row {
        Row::template(self.source.columns.iter().map(|(name, _)| name.as_str()))
    }
}

impl Iterator for MergedRows<'_> {
    type Item = ReportResult<KeyedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let source = self.source;
        loop {
            let (key, stream, row) = match self.merge.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => return Some(Err(e)),
                None => match self.current.take() {
                    Some(last) if source.passes_post_filters(&last.1, self.ctx) => {
                        return Some(Ok(last))
                    }
                    Some(_) => continue,
                    None => return None,
                },
            };
            let report = source.included[stream].name.as_str();

            if let Some((current_key, merged)) = self.current.as_mut() {
                if *current_key == key {
                    source.fold(report, merged, &row);
                    continue;
                }
            }
            let mut merged = self.template();
            source.fold(report, &mut merged, &row);
            if let Some(finished) = self.current.replace((key, merged)) {
                if source.passes_post_filters(&finished.1, self.ctx) {
                    return Some(Ok(finished));
                }
            }
        }
    }
}
