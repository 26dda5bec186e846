//! Report definitions and the run orchestrator.
//!
//! A [`ReportDefinition`] is the declarative description of a report: keys,
//! columns, filters, and the collaborators its sources need. A [`Report`]
//! binds a definition to a cache and owns the per-run state: the user input
//! snapshots, the source instances, and the cache identity of the run.
//!
//! Running a report drives a [`ReportRun`], which merges the key rows with
//! every source's rows into complete report rows, and hands it to the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use inflector::Inflector;
use serde_json::{json, Value as Json};

use crate::cache::{input_fingerprint, CacheError, ReportCache, RowQuery, RowStream, Sort};
use crate::column::{Column, Footer};
use crate::database::Database;
use crate::error::{ReportError, ReportResult, ValidationError};
use crate::filter::Filter;
use crate::format::OutputMode;
use crate::key_range::{key_rows, KeyRange};
use crate::row::{KeyedRow, Row};
use crate::source::{instantiate, RunContext, Source, SourceFactory, SourceKind};
use crate::stream::{tee, KMerge, KeyedStream};
use crate::value::Value;

/// How long a finished run stays in the cache unless the report says otherwise.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Name of the hidden leading column holding the cached row id.
pub const ROW_ID_COLUMN: &str = "_row_id";

/// Builds a fresh definition, used for merge sub-reports and the registry.
pub type ReportFactory = Arc<dyn Fn() -> ReportDefinition + Send + Sync>;

// ============================================================================
// Definition
// ============================================================================

/// Declarative description of a report, assembled with builder methods.
///
/// ```ignore
/// let definition = ReportDefinition::new("WidgetsPerUserReport")
///     .with_database(db, "widgets")
///     .with_key("user_id", KeyRange::Source)
///     .with_column("user_id", database::group_by("user_id"))
///     .with_column("num_widgets", database::count("id"));
/// ```
#[derive(Clone)]
pub struct ReportDefinition {
    display_name: String,
    code_name: String,
    category: Option<String>,
    cache_ttl: Duration,
    keys: Vec<(String, KeyRange)>,
    columns: Vec<(String, Column)>,
    filters: Vec<(String, Filter)>,
    default_sort: Option<Sort>,
    database: Option<(Arc<Database>, String)>,
    merged_reports: BTreeMap<String, ReportFactory>,
    custom_sources: BTreeMap<&'static str, SourceFactory>,
}

impl ReportDefinition {
    /// Starts a definition from a type-style name such as
    /// `CelebrityApprovalReport`, which displays as "Celebrity Approval
    /// Report" under the code name `celebrity_approval_report`.
    pub fn new(type_name: &str) -> Self {
        let display_name = type_name.to_title_case();
        Self {
            code_name: display_name.to_snake_case(),
            display_name,
            category: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            keys: Vec::new(),
            columns: Vec::new(),
            filters: Vec::new(),
            default_sort: None,
            database: None,
            merged_reports: BTreeMap::new(),
            custom_sources: BTreeMap::new(),
        }
    }

    /// Overrides the display name. The code name follows it.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self.code_name = self.display_name.to_snake_case();
        self
    }

    pub fn with_code_name(mut self, code_name: impl Into<String>) -> Self {
        self.code_name = code_name.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Adds a key. Compound keys are ordered as declared.
    pub fn with_key(mut self, name: impl Into<String>, range: KeyRange) -> Self {
        self.keys.push((name.into(), range));
        self
    }

    /// Adds a column. An unlabeled column is labeled with its title-cased name.
    pub fn with_column(mut self, name: impl Into<String>, mut column: Column) -> Self {
        let name = name.into();
        column.format.set_default_label(name.to_title_case());
        self.columns.push((name, column));
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, filter: Filter) -> Self {
        self.filters.push((name.into(), filter));
        self
    }

    pub fn with_default_sort(mut self, sort: Sort) -> Self {
        self.default_sort = Some(sort);
        self
    }

    /// The table database columns aggregate over.
    pub fn with_database(mut self, db: Arc<Database>, table: impl Into<String>) -> Self {
        self.database = Some((db, table.into()));
        self
    }

    /// Adds a sub-report for merge columns to combine.
    pub fn with_merged_report<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> ReportDefinition + Send + Sync + 'static,
    {
        self.merged_reports.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registers the source that fills [`Column::custom`] columns named `name`.
    pub fn with_source<F>(mut self, name: &'static str, factory: F) -> Self
    where
        F: Fn(&ReportDefinition) -> ReportResult<Box<dyn Source>> + Send + Sync + 'static,
    {
        self.custom_sources.insert(name, Arc::new(factory));
        self
    }

    pub fn code_name(&self) -> &str {
        &self.code_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn keys(&self) -> &[(String, KeyRange)] {
        &self.keys
    }

    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(name, _)| name.as_str())
    }

    pub fn columns(&self) -> &[(String, Column)] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, column)| column)
    }

    /// Columns owned by the source of `kind`, in declaration order.
    pub fn columns_of(&self, kind: SourceKind) -> impl Iterator<Item = (&str, &Column)> {
        self.columns
            .iter()
            .filter(move |(_, column)| column.source_kind() == kind)
            .map(|(name, column)| (name.as_str(), column))
    }

    pub fn filters(&self) -> impl Iterator<Item = (&str, &Filter)> {
        self.filters.iter().map(|(name, filter)| (name.as_str(), filter))
    }

    pub fn database(&self) -> Option<(&Arc<Database>, &str)> {
        self.database.as_ref().map(|(db, table)| (db, table.as_str()))
    }

    /// Sub-reports in name order.
    pub fn merged_reports(&self) -> impl Iterator<Item = (&str, &ReportFactory)> {
        self.merged_reports
            .iter()
            .map(|(name, factory)| (name.as_str(), factory))
    }

    pub fn custom_source(&self, name: &str) -> Option<&SourceFactory> {
        self.custom_sources.get(name)
    }

    /// The requested default sort, or the first column descending.
    pub fn default_sort(&self) -> Option<Sort> {
        self.default_sort.clone().or_else(|| {
            self.columns
                .first()
                .map(|(name, _)| Sort::desc(name.clone()))
        })
    }

    /// Name a filter's widget is submitted under.
    pub fn form_name(&self, filter: &str) -> String {
        format!("{}_{filter}", self.code_name)
    }

    /// Frontend descriptions of every filter widget.
    pub fn widgets(&self) -> Vec<Json> {
        self.filters
            .iter()
            .filter_map(|(name, filter)| {
                filter
                    .widget
                    .as_ref()
                    .map(|widget| widget.describe(&self.form_name(name)))
            })
            .collect()
    }

    /// Sources in merge order: first appearance of each kind among the
    /// columns, with the derived source last so its formulas see every
    /// other cell.
    pub fn source_kinds(&self) -> Vec<SourceKind> {
        let mut kinds: Vec<SourceKind> = Vec::new();
        for (_, column) in &self.columns {
            let kind = column.source_kind();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if let Some(pos) = kinds.iter().position(|k| *k == SourceKind::Derived) {
            let derived = kinds.remove(pos);
            kinds.push(derived);
        }
        kinds
    }

    fn validate(&self) -> ReportResult<()> {
        if self.columns.is_empty() {
            return Err(ReportError::config(format!(
                "report {} declares no columns",
                self.code_name
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some((name, _)) = self.columns.iter().find(|(name, _)| !seen.insert(name)) {
            return Err(ReportError::config(format!("duplicate column {name}")));
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some((name, _)) = self.filters.iter().find(|(name, _)| !seen.insert(name)) {
            return Err(ReportError::config(format!("duplicate filter {name}")));
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some((name, _)) = self.keys.iter().find(|(name, _)| !seen.insert(name)) {
            return Err(ReportError::config(format!("duplicate key {name}")));
        }
        if let Some((name, _)) = self.filters.iter().find(|(_, filter)| {
            matches!(filter.kind, crate::filter::FilterKind::Report(_)) && filter.widget.is_none()
        }) {
            return Err(ReportError::config(format!(
                "report filter {name} needs a widget"
            )));
        }
        if let Some(sort) = &self.default_sort {
            if self.column(&sort.column).is_none() {
                return Err(ReportError::UnknownColumn(sort.column.clone()));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ReportDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportDefinition")
            .field("code_name", &self.code_name)
            .field("keys", &self.keys)
            .field("columns", &self.columns)
            .field("filters", &self.filters)
            .field("merged_reports", &self.merged_reports.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Lifecycle of a report instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    InputsValidated,
    Running,
    Completed,
}

/// A report bound to a cache.
///
/// Not meant to be shared between concurrent runs: the input snapshots and
/// footer state belong to one run at a time.
pub struct Report {
    definition: ReportDefinition,
    cache: Arc<dyn ReportCache>,
    sources: Vec<Box<dyn Source>>,
    state: RunState,
    dirty_inputs: BTreeMap<String, String>,
    clean_inputs: BTreeMap<String, Option<Value>>,
    input_errors: Vec<ValidationError>,
    unique_id: Option<(String, String)>,
    context: RunContext,
}

impl Report {
    /// Builds the report and validates the empty input set, so a report
    /// without required inputs is ready to run.
    pub fn new(definition: ReportDefinition, cache: Arc<dyn ReportCache>) -> ReportResult<Self> {
        let mut report = Self::new_merged(definition, cache)?;
        report.clean_user_inputs(&BTreeMap::new());
        Ok(report)
    }

    /// Builds the report without validating inputs. Merge sources use this
    /// for sub-reports, whose inputs come from the parent.
    pub fn new_merged(definition: ReportDefinition, cache: Arc<dyn ReportCache>) -> ReportResult<Self> {
        definition.validate()?;
        let sources = definition
            .source_kinds()
            .into_iter()
            .map(|kind| instantiate(kind, &definition, &cache))
            .collect::<ReportResult<Vec<_>>>()?;
        Ok(Self {
            definition,
            cache,
            sources,
            state: RunState::Uninitialized,
            dirty_inputs: BTreeMap::new(),
            clean_inputs: BTreeMap::new(),
            input_errors: Vec::new(),
            unique_id: None,
            context: RunContext::default(),
        })
    }

    pub fn definition(&self) -> &ReportDefinition {
        &self.definition
    }

    pub fn code_name(&self) -> &str {
        self.definition.code_name()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Errors from the most recent input validation.
    pub fn input_errors(&self) -> &[ValidationError] {
        &self.input_errors
    }

    pub fn clean_inputs(&self) -> &BTreeMap<String, Option<Value>> {
        &self.clean_inputs
    }

    /// Validates raw form inputs against every filter widget.
    ///
    /// Each widget reads its form name first, then its bare filter name.
    /// Inputs not supplied again keep their previous raw value. On any
    /// failure the previous snapshots are kept and the errors returned.
    pub fn clean_user_inputs(&mut self, raw: &BTreeMap<String, String>) -> Vec<ValidationError> {
        let mut dirty = self.dirty_inputs.clone();
        let mut clean = BTreeMap::new();
        let mut errors = Vec::new();

        for (name, filter) in self.definition.filters() {
            let Some(widget) = &filter.widget else {
                continue;
            };
            let pick = |key: &str| raw.get(key).or_else(|| dirty.get(key)).cloned();
            let mut key = self.definition.form_name(name);
            let mut input = pick(&key);
            if input.as_deref().map_or(true, str::is_empty) {
                key = name.to_string();
                input = pick(&key);
            }

            match widget.clean(input.as_deref()) {
                Ok(value) => {
                    clean.insert(name.to_string(), value);
                }
                Err(e) => errors.push(e),
            }
            if let Some(input) = input {
                dirty.insert(key, input);
            }
        }

        self.input_errors = errors.clone();
        if errors.is_empty() {
            self.dirty_inputs = dirty;
            self.clean_inputs = clean;
            self.state = RunState::InputsValidated;
        } else {
            tracing::debug!(report = %self.code_name(), errors = errors.len(), "user inputs rejected");
        }
        errors
    }

    /// Cache identity of this run: the code name and a fingerprint of the
    /// raw inputs, unless overridden.
    pub fn unique_id(&self) -> (String, String) {
        self.unique_id.clone().unwrap_or_else(|| {
            (
                self.code_name().to_string(),
                input_fingerprint(&self.dirty_inputs),
            )
        })
    }

    /// Pins the cache identity regardless of later inputs.
    pub fn set_unique_id(&mut self, id: (String, String)) {
        self.unique_id = Some(id);
    }

    fn ensure_inputs(&mut self) -> ReportResult<()> {
        if self.state == RunState::Uninitialized {
            let errors = self.clean_user_inputs(&BTreeMap::new());
            if !errors.is_empty() {
                return Err(ReportError::Validation(errors));
            }
        }
        Ok(())
    }

    /// Prepares every source and returns the lazy row stream for one run.
    ///
    /// The footer restarts with every run.
    pub fn start_run(&mut self) -> ReportResult<ReportRun<'_>> {
        self.ensure_inputs()?;
        let context = RunContext::new(
            self.code_name(),
            self.unique_id(),
            self.clean_inputs.clone(),
            self.dirty_inputs.clone(),
        );
        for source in &mut self.sources {
            source.pre_process(&context)?;
        }
        self.context = context;
        self.state = RunState::Running;
        tracing::info!(report = %self.code_name(), instance = %self.context.instance_id, "report run started");

        let report: &Report = self;
        ReportRun::new(report)
    }

    /// Runs the report end to end and stores the result in the cache.
    pub fn run_report(&mut self) -> ReportResult<()> {
        let cache = Arc::clone(&self.cache);
        let (report_id, instance_id) = self.unique_id();
        let ttl = self.definition.cache_ttl();
        {
            let mut run = self.start_run()?;
            cache
                .create_instance(&report_id, &instance_id, &mut run, ttl)
                .map_err(|e| match e {
                    CacheError::Stream(inner) => *inner,
                    other => ReportError::Cache(other),
                })?;
        }
        self.state = RunState::Completed;
        Ok(())
    }

    /// Removes this instance from the cache, or every instance of the
    /// report when `full` is set.
    pub fn kill_cache(&self, full: bool) -> ReportResult<()> {
        let (report_id, instance_id) = self.unique_id();
        if full {
            self.cache.kill_report_cache(&report_id)?;
        } else {
            self.cache.kill_instance_cache(&report_id, &instance_id)?;
        }
        Ok(())
    }

    pub fn is_report_started(&self) -> ReportResult<bool> {
        let (report_id, instance_id) = self.unique_id();
        Ok(self.cache.is_instance_started(&report_id, &instance_id)?)
    }

    pub fn is_report_finished(&self) -> ReportResult<bool> {
        let (report_id, instance_id) = self.unique_id();
        Ok(self.cache.is_instance_finished(&report_id, &instance_id)?)
    }

    pub fn report_row_count(&self) -> ReportResult<usize> {
        let (report_id, instance_id) = self.unique_id();
        Ok(self.cache.instance_row_count(&report_id, &instance_id)?)
    }

    /// When the cached instance was created.
    pub fn report_timestamp(&self) -> ReportResult<DateTime<Utc>> {
        let (report_id, instance_id) = self.unique_id();
        Ok(self.cache.instance_timestamp(&report_id, &instance_id)?)
    }

    /// Header metadata: the hidden row id column, then one entry per column.
    pub fn report_header(&self) -> Vec<Json> {
        let mut header = vec![json!({
            "key": ROW_ID_COLUMN,
            "label": "Row ID",
            "hidden": true,
            "sortable": false,
        })];
        for (name, column) in self.definition.columns() {
            let mut info = column.format.header_info();
            info.insert("key".into(), json!(name));
            header.push(Json::Object(info));
        }
        header
    }

    /// Formatted cached rows, each led by its row id.
    ///
    /// Without a sort in `query` the report's default sort applies.
    /// Alphabetical ordering follows the sort column's format.
    pub fn report_rows(&self, mut query: RowQuery, mode: OutputMode) -> ReportResult<Vec<Vec<Json>>> {
        if query.sort.is_none() {
            query.sort = self.definition.default_sort();
        }
        if let Some(sort) = &query.sort {
            let column = self
                .definition
                .column(&sort.column)
                .ok_or_else(|| ReportError::UnknownColumn(sort.column.clone()))?;
            query.alpha = column.sort_alpha();
        }

        let (report_id, instance_id) = self.unique_id();
        let rows = self.cache.instance_rows(&report_id, &instance_id, &query)?;
        Ok(rows
            .into_iter()
            .map(|cached| {
                std::iter::once(json!(cached.id))
                    .chain(
                        self.definition
                            .columns()
                            .iter()
                            .map(|(name, column)| column.format.format(cached.row.get(name), mode)),
                    )
                    .collect()
            })
            .collect())
    }

    /// The formatted footer. The row id slot and footer-less columns are null.
    pub fn report_footer(&self, mode: OutputMode) -> ReportResult<Vec<Json>> {
        let (report_id, instance_id) = self.unique_id();
        let footer = self.cache.instance_footer(&report_id, &instance_id)?;
        Ok(std::iter::once(Json::Null)
            .chain(self.definition.columns().iter().map(|(name, column)| {
                if column.footer {
                    column.format.format(footer.get(name), mode)
                } else {
                    Json::Null
                }
            }))
            .collect())
    }

    /// Every cached row of the current instance, in emission order.
    pub fn cached_rows(&self) -> ReportResult<Vec<Row>> {
        let (report_id, instance_id) = self.unique_id();
        let rows = self
            .cache
            .instance_rows(&report_id, &instance_id, &RowQuery::default())?;
        Ok(rows.into_iter().map(|cached| cached.row).collect())
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (report_id, instance_id) = self.unique_id();
        write!(f, "<Report {report_id} {instance_id}>")
    }
}

// ============================================================================
// Row merge
// ============================================================================

/// One run's lazy stream of complete report rows.
///
/// Merges the key rows (stream 0) with every source's rows in source
/// order. Partial rows sharing a key are overlaid field by field, so a later
/// source overwrites an earlier one. Each completed row goes through every
/// source's `post_process` and into the footer before it is yielded.
pub struct ReportRun<'a> {
    report: &'a Report,
    merge: KMerge<'a, Row>,
    /// Key column names, present in every row whether declared or not.
    key_names: Vec<&'a str>,
    template: Row,
    current: Option<KeyedRow>,
    footer: Footer,
    finalized: Option<Row>,
    exhausted: bool,
    failed: bool,
    rows: usize,
    started: Instant,
}

impl<'a> ReportRun<'a> {
    fn new(report: &'a Report) -> ReportResult<Self> {
        let definition = &report.definition;
        let ctx = &report.context;
        let keys = key_rows(definition.keys(), ctx)?;

        let mut streams: Vec<KeyedStream<'a, Row>> = Vec::with_capacity(report.sources.len() + 1);
        let mut tees = tee(keys, report.sources.len() + 1).into_iter();
        if let Some(reserved) = tees.next() {
            streams.push(Box::new(reserved.map(Ok::<KeyedRow, ReportError>)));
        }
        for (source, key_rows) in report.sources.iter().zip(tees) {
            streams.push(source.get_rows(Box::new(key_rows), ctx)?);
        }

        let columns = definition.columns();
        let key_names: Vec<&'a str> = definition.key_names().collect();
        Ok(Self {
            report,
            merge: KMerge::new(streams),
            template: Row::template(
                columns
                    .iter()
                    .map(|(name, _)| name.as_str())
                    .chain(key_names.iter().copied()),
            ),
            key_names,
            current: None,
            footer: Footer::new(columns.len()),
            finalized: None,
            exhausted: false,
            failed: false,
            rows: 0,
            started: Instant::now(),
        })
    }

    /// Post-processes a merged row, trims it to the key and declared
    /// columns, and adds it to the footer.
    fn complete(&mut self, mut row: Row) -> Row {
        let report = self.report;
        for source in &report.sources {
            row = source.post_process(row, &report.context);
        }
        let columns = report.definition.columns();
        let row: Row = columns
            .iter()
            .map(|(name, _)| name.as_str())
            .chain(self.key_names.iter().copied())
            .map(|name| (name.to_string(), row.get(name).cloned()))
            .collect();
        self.footer.increment(columns, &row);
        row
    }

    fn step(&mut self) -> ReportResult<Option<Row>> {
        loop {
            let Some(entry) = self.merge.next() else {
                let last = self.current.take();
                return Ok(last.map(|(_, row)| self.complete(row)));
            };
            let (key, _, partial) = entry?;

            if let Some((current_key, row)) = self.current.as_mut() {
                if *current_key == key {
                    row.merge(partial);
                    continue;
                }
            }
            let mut row = self.template.clone();
            for (name, part) in self.key_names.iter().zip(key.parts()) {
                row.set(name, part.clone());
            }
            row.merge(partial);
            if let Some((_, finished)) = self.current.replace((key, row)) {
                return Ok(Some(self.complete(finished)));
            }
        }
    }

    /// Rows yielded so far.
    pub fn row_count(&self) -> usize {
        self.rows
    }
}

impl Iterator for ReportRun<'_> {
    type Item = ReportResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(row)) => {
                self.rows += 1;
                Some(Ok(row))
            }
            Ok(None) => {
                self.exhausted = true;
                tracing::info!(
                    report = %self.report.code_name(),
                    rows = self.rows,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "report run finished"
                );
                None
            }
            Err(e) => {
                self.failed = true;
                tracing::warn!(report = %self.report.code_name(), error = %e, "report run failed");
                Some(Err(e))
            }
        }
    }
}

impl RowStream for ReportRun<'_> {
    fn column_names(&self) -> Vec<String> {
        self.report
            .definition
            .columns()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn finalize_footer(&mut self) -> ReportResult<Row> {
        if !self.exhausted {
            return Err(ReportError::FooterNotReady);
        }
        if let Some(footer) = &self.finalized {
            return Ok(footer.clone());
        }
        let columns = self.report.definition.columns();
        let footer = std::mem::replace(&mut self.footer, Footer::new(0)).finalize(columns);
        self.finalized = Some(footer.clone());
        Ok(footer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::widget::Widget;

    fn cache() -> Arc<dyn ReportCache> {
        Arc::new(MemoryCache::new())
    }

    #[test]
    fn test_names_from_type_name() {
        let definition = ReportDefinition::new("CelebrityApprovalReport");
        assert_eq!(definition.display_name(), "Celebrity Approval Report");
        assert_eq!(definition.code_name(), "celebrity_approval_report");
        assert_eq!(definition.cache_ttl(), DEFAULT_CACHE_TTL);
    }

    #[test]
    fn test_default_label_and_sort() {
        let definition = ReportDefinition::new("Labels")
            .with_column("num_widgets", Column::constant(1))
            .with_column("other", Column::constant(2));
        let column = definition.column("num_widgets").unwrap();
        assert_eq!(column.format.label(), Some("Num Widgets"));
        assert_eq!(definition.default_sort(), Some(Sort::desc("num_widgets")));
    }

    #[test]
    fn test_derived_source_runs_last() {
        let definition = ReportDefinition::new("Order")
            .with_key("id", KeyRange::iterable([1]))
            .with_column("ratio", Column::derived(|row| row.num("a")?.div(&row.num("b")?)))
            .with_column("id", Column::key())
            .with_column("a", Column::constant(1));
        assert_eq!(
            definition.source_kinds(),
            vec![SourceKind::Key, SourceKind::Static, SourceKind::Derived]
        );
    }

    #[test]
    fn test_duplicate_column_is_config_error() {
        let definition = ReportDefinition::new("Dupes")
            .with_column("a", Column::constant(1))
            .with_column("a", Column::constant(2));
        assert!(matches!(
            Report::new(definition, cache()),
            Err(ReportError::Config(_))
        ));
    }

    #[test]
    fn test_failed_validation_keeps_previous_inputs() {
        let definition = ReportDefinition::new("Inputs")
            .with_column("a", Column::constant(1))
            .with_filter("start", Filter::delegated(Widget::date_picker()));
        let mut report = Report::new(definition, cache()).unwrap();
        assert_eq!(report.state(), RunState::InputsValidated);

        let good = BTreeMap::from([("inputs_start".to_string(), "01/31/2010".to_string())]);
        assert!(report.clean_user_inputs(&good).is_empty());
        let id = report.unique_id();

        let bad = BTreeMap::from([("inputs_start".to_string(), "garbage".to_string())]);
        assert_eq!(report.clean_user_inputs(&bad).len(), 1);
        assert_eq!(report.unique_id(), id);
        assert!(report.clean_inputs().get("start").is_some());
    }

    #[test]
    fn test_bare_filter_name_fallback_and_carry_over() {
        let definition = ReportDefinition::new("Inputs")
            .with_column("a", Column::constant(1))
            .with_filter("name", Filter::delegated(Widget::text()))
            .with_filter("flag", Filter::delegated(Widget::checkbox()));
        let mut report = Report::new(definition, cache()).unwrap();

        let first = BTreeMap::from([("name".to_string(), "bob".to_string())]);
        assert!(report.clean_user_inputs(&first).is_empty());
        let second = BTreeMap::from([("inputs_flag".to_string(), "on".to_string())]);
        assert!(report.clean_user_inputs(&second).is_empty());

        assert_eq!(report.clean_inputs()["name"], Some(Value::from("bob")));
        assert_eq!(report.clean_inputs()["flag"], Some(Value::Bool(true)));
    }

    #[test]
    fn test_unique_id_override_is_permanent() {
        let definition = ReportDefinition::new("Pinned")
            .with_column("a", Column::constant(1))
            .with_filter("name", Filter::delegated(Widget::text()));
        let mut report = Report::new(definition, cache()).unwrap();
        let (code, fingerprint) = report.unique_id();
        assert_eq!(code, "pinned");
        assert_eq!(fingerprint.len(), 32);

        report.set_unique_id(("parent".into(), "abc::pinned".into()));
        let inputs = BTreeMap::from([("name".to_string(), "x".to_string())]);
        report.clean_user_inputs(&inputs);
        assert_eq!(report.unique_id(), ("parent".into(), "abc::pinned".into()));
    }
}
