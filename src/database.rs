//! The SQLite reporting database and the database source.
//!
//! The database source turns a report's database columns into grouped
//! aggregate queries over a single table. Report keys must be group-by
//! columns. Column-scoped query filters each get their own query, and the
//! per-filter result streams are merged back together by key alongside the
//! key rows. Lookup columns are filled afterwards by batched primary-key
//! queries against other tables.
//!
//! # Column expressions
//!
//! ```text
//! GroupBy       expr                       (GROUP BY + ORDER BY expr)
//! Sum           SUM(expr)
//! Count         COUNT(expr) | COUNT(DISTINCT expr)
//! First         first non-null value in the group
//! BoolAnd       MIN(expr) as bool
//! BoolOr        MAX(expr) as bool
//! ArrayAgg      json_group_array(expr) as list
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};

use crate::column::{Column, ColumnKind};
use crate::error::{ReportError, ReportResult};
use crate::filter::{Filter, FilterKind, QueryFn, TransformFn};
use crate::report::ReportDefinition;
use crate::row::{Key, KeyedRow, Row};
use crate::source::{KeyRows, RunContext, Source, SourceKind};
use crate::stream::{KMerge, KeyedStream};
use crate::value::Value;

/// Rows fetched per page, and rows staged per lookup batch.
pub const QUERY_LIMIT: usize = 250;

/// A raw result row.
pub type SqlRow = Vec<Option<Value>>;

// ============================================================================
// Database handle
// ============================================================================

/// Shared handle to the reporting database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> ReportResult<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> ReportResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn execute_batch(&self, sql: &str) -> ReportResult<()> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> ReportResult<usize> {
        let changed = self
            .conn()
            .execute(sql, params_from_iter(params.iter().map(Value::to_sql)))?;
        Ok(changed)
    }

    /// Runs a query and collects every row.
    pub fn query(&self, sql: &str, params: &[Value]) -> ReportResult<Vec<SqlRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let width = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter().map(Value::to_sql)), |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(from_sql))
                .collect::<rusqlite::Result<SqlRow>>()
        })?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn from_sql(value: ValueRef<'_>) -> Option<Value> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(Value::Int(i)),
        ValueRef::Real(f) => Some(Value::Float(f)),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Some(Value::Str(String::from_utf8_lossy(t).into_owned()))
        }
    }
}

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Pages through a query `QUERY_LIMIT` rows at a time.
struct PagedQuery<'a> {
    db: &'a Database,
    sql: String,
    params: Vec<Value>,
    offset: usize,
    page: VecDeque<SqlRow>,
    done: bool,
}

impl<'a> PagedQuery<'a> {
    fn new(db: &'a Database, sql: String, params: Vec<Value>) -> Self {
        Self {
            db,
            sql,
            params,
            offset: 0,
            page: VecDeque::new(),
            done: false,
        }
    }

    fn fetch(&mut self) -> ReportResult<()> {
        let sql = format!("{} LIMIT {} OFFSET {}", self.sql, QUERY_LIMIT, self.offset);
        let rows = self.db.query(&sql, &self.params)?;
        self.done = rows.len() < QUERY_LIMIT;
        self.offset += rows.len();
        self.page.extend(rows);
        Ok(())
    }
}

impl Iterator for PagedQuery<'_> {
    type Item = ReportResult<SqlRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            if let Err(e) = self.fetch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

// ============================================================================
// Conditions and entities
// ============================================================================

/// A parameterized SQL condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Condition {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn eq(expr: &str, value: impl Into<Value>) -> Self {
        Self::compare(expr, "=", value)
    }

    /// `expr <op> ?` for a comparison operator such as `>=`.
    pub fn compare(expr: &str, op: &str, value: impl Into<Value>) -> Self {
        Self::new(format!("{expr} {op} ?"), vec![value.into()])
    }

    /// Membership test. An empty set matches nothing.
    pub fn is_in(expr: &str, values: impl IntoIterator<Item = Value>) -> Self {
        let params: Vec<Value> = values.into_iter().collect();
        if params.is_empty() {
            return Self::new("0", Vec::new());
        }
        let slots = vec!["?"; params.len()].join(", ");
        Self::new(format!("{expr} IN ({slots})"), params)
    }

    pub fn is_not_null(expr: &str) -> Self {
        Self::new(format!("{expr} IS NOT NULL"), Vec::new())
    }

    pub fn and(mut self, other: Condition) -> Self {
        self.sql = format!("({}) AND ({})", self.sql, other.sql);
        self.params.extend(other.params);
        self
    }
}

/// ` WHERE ...` for the conditions, empty when there are none.
fn where_clause(conditions: Vec<Condition>) -> (String, Vec<Value>) {
    if conditions.is_empty() {
        return (String::new(), Vec::new());
    }
    let mut params = Vec::new();
    let mut parts = Vec::with_capacity(conditions.len());
    for condition in conditions {
        parts.push(format!("({})", condition.sql));
        params.extend(condition.params);
    }
    (format!(" WHERE {}", parts.join(" AND ")), params)
}

/// The table a query filter runs against.
///
/// Column access applies every column transform that targets the column, in
/// declaration order.
pub struct Entity<'a> {
    table: &'a str,
    transforms: Vec<(&'a BTreeSet<String>, &'a TransformFn, Option<&'a Value>)>,
}

impl<'a> Entity<'a> {
    pub fn new(table: &'a str) -> Self {
        Self {
            table,
            transforms: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        self.table
    }

    /// SQL expression for a table column.
    pub fn col(&self, name: &str) -> String {
        self.transforms
            .iter()
            .filter(|(columns, _, _)| columns.contains(name))
            .fold(quote_ident(name), |expr, (_, transform, input)| {
                transform(&expr, *input)
            })
    }
}

// ============================================================================
// Columns
// ============================================================================

/// A primary-key lookup into another table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub table: String,
    /// Column read from the lookup table.
    pub attr: String,
    /// Report column holding the primary key.
    pub pk_column: String,
    /// Primary key column of the lookup table.
    pub pk_attr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseColumn {
    GroupBy { column: String, include_null: bool },
    Sum(String),
    Count { column: String, distinct: bool },
    First(String),
    BoolAnd(String),
    BoolOr(String),
    ArrayAgg(String),
    Lookup(Lookup),
}

impl DatabaseColumn {
    /// Group-by columns never total.
    pub fn has_footer(&self) -> bool {
        !matches!(self, Self::GroupBy { .. })
    }

    fn is_lookup(&self) -> bool {
        matches!(self, Self::Lookup(_))
    }

    fn expression(&self, entity: &Entity<'_>) -> String {
        match self {
            Self::GroupBy { column, .. } => entity.col(column),
            Self::Sum(column) => format!("SUM({})", entity.col(column)),
            Self::Count { column, distinct } => {
                let distinct = if *distinct { "DISTINCT " } else { "" };
                format!("COUNT({distinct}{})", entity.col(column))
            }
            Self::First(column) => {
                let expr = entity.col(column);
                format!(
                    "json_extract(json_group_array({expr}) FILTER (WHERE {expr} IS NOT NULL), '$[0]')"
                )
            }
            Self::BoolAnd(column) => format!("MIN({})", entity.col(column)),
            Self::BoolOr(column) => format!("MAX({})", entity.col(column)),
            Self::ArrayAgg(column) => format!("json_group_array({})", entity.col(column)),
            Self::Lookup(_) => "NULL".to_string(),
        }
    }

    fn decode(&self, raw: Option<Value>) -> Option<Value> {
        match self {
            Self::BoolAnd(_) | Self::BoolOr(_) => raw.map(|v| Value::Bool(v.is_truthy())),
            Self::ArrayAgg(_) => raw.map(|v| match v {
                Value::Str(json) => parse_list(&json),
                other => other,
            }),
            _ => raw,
        }
    }
}

fn parse_list(json: &str) -> Value {
    fn convert(item: serde_json::Value) -> Option<Value> {
        match item {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Value::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Float)),
            serde_json::Value::String(s) => Some(Value::Str(s)),
            other => Some(Value::Str(other.to_string())),
        }
    }
    match serde_json::from_str::<Vec<serde_json::Value>>(json) {
        Ok(items) => Value::List(items.into_iter().filter_map(convert).collect()),
        Err(_) => Value::Str(json.to_string()),
    }
}

fn database(column: DatabaseColumn) -> Column {
    Column::new(ColumnKind::Database(column))
}

/// Groups by a table column, leaving out the NULL group.
pub fn group_by(column: &str) -> Column {
    database(DatabaseColumn::GroupBy {
        column: column.to_string(),
        include_null: false,
    })
}

pub fn group_by_including_null(column: &str) -> Column {
    database(DatabaseColumn::GroupBy {
        column: column.to_string(),
        include_null: true,
    })
}

pub fn sum(column: &str) -> Column {
    database(DatabaseColumn::Sum(column.to_string()))
}

pub fn count(column: &str) -> Column {
    database(DatabaseColumn::Count {
        column: column.to_string(),
        distinct: false,
    })
}

pub fn count_distinct(column: &str) -> Column {
    database(DatabaseColumn::Count {
        column: column.to_string(),
        distinct: true,
    })
}

/// The first non-null value in the group.
pub fn first(column: &str) -> Column {
    database(DatabaseColumn::First(column.to_string()))
}

pub fn bool_and(column: &str) -> Column {
    database(DatabaseColumn::BoolAnd(column.to_string()))
}

pub fn bool_or(column: &str) -> Column {
    database(DatabaseColumn::BoolOr(column.to_string()))
}

pub fn array_agg(column: &str) -> Column {
    database(DatabaseColumn::ArrayAgg(column.to_string()))
}

/// Reads `attr` from the row of `table` whose `id` equals the report's
/// `pk_column` cell.
pub fn lookup(table: &str, attr: &str, pk_column: &str) -> Column {
    lookup_by(table, attr, pk_column, "id")
}

pub fn lookup_by(table: &str, attr: &str, pk_column: &str, pk_attr: &str) -> Column {
    database(DatabaseColumn::Lookup(Lookup {
        table: table.to_string(),
        attr: attr.to_string(),
        pk_column: pk_column.to_string(),
        pk_attr: pk_attr.to_string(),
    }))
}

// ============================================================================
// Table key range
// ============================================================================

/// Keys from the primary key column of a table, optionally filtered.
#[derive(Clone)]
pub struct TableKeyRange {
    db: Arc<Database>,
    table: String,
    pk_column: String,
    filters: Vec<(Option<String>, QueryFn)>,
}

impl TableKeyRange {
    pub fn new(db: Arc<Database>, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
            pk_column: "id".to_string(),
            filters: Vec::new(),
        }
    }

    pub fn with_pk_column(mut self, pk_column: impl Into<String>) -> Self {
        self.pk_column = pk_column.into();
        self
    }

    pub fn filter<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Entity<'_>, Option<&Value>) -> Option<Condition> + Send + Sync + 'static,
    {
        self.filters.push((None, Arc::new(condition)));
        self
    }

    /// A filter driven by the cleaned input of the named report filter.
    pub fn filter_with_input<F>(mut self, input: &str, condition: F) -> Self
    where
        F: Fn(&Entity<'_>, Option<&Value>) -> Option<Condition> + Send + Sync + 'static,
    {
        self.filters
            .push((Some(input.to_string()), Arc::new(condition)));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Sorted distinct primary keys.
    pub fn keys(&self, ctx: &RunContext) -> ReportResult<Vec<Value>> {
        let entity = Entity::new(&self.table);
        let pk = entity.col(&self.pk_column);
        let mut conditions = vec![Condition::is_not_null(&pk)];
        for (input, filter) in &self.filters {
            let input = input.as_deref().and_then(|name| ctx.input(name));
            conditions.extend(filter(&entity, input));
        }
        let (clause, params) = where_clause(conditions);
        let sql = format!(
            "SELECT DISTINCT {pk} FROM {}{clause} ORDER BY {pk}",
            quote_ident(&self.table)
        );
        let rows = self.db.query(&sql, &params)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }
}

// ============================================================================
// Database source
// ============================================================================

/// Columns fetched together by one grouped query.
struct QueryGroup {
    columns: Vec<String>,
    /// Index into `DatabaseSource::filters` of the column-scoped filter.
    filter: Option<usize>,
}

struct LookupGroup {
    table: String,
    pk_attr: String,
    pk_column: String,
    columns: Vec<(String, String)>,
}

pub struct DatabaseSource {
    db: Arc<Database>,
    table: String,
    keys: Vec<String>,
    columns: BTreeMap<String, DatabaseColumn>,
    filters: Vec<(String, Filter)>,
    groups: Vec<QueryGroup>,
    lookups: Vec<LookupGroup>,
}

impl DatabaseSource {
    pub fn new(definition: &ReportDefinition) -> ReportResult<Self> {
        let (db, table) = definition.database().ok_or_else(|| {
            ReportError::config("database columns require a database table")
        })?;

        let mut declared = Vec::new();
        let mut columns = BTreeMap::new();
        for (name, column) in definition.columns_of(SourceKind::Database) {
            if let ColumnKind::Database(db_column) = &column.kind {
                declared.push(name.to_string());
                columns.insert(name.to_string(), db_column.clone());
            }
        }

        let keys: Vec<String> = definition.key_names().map(str::to_string).collect();
        for key in &keys {
            if !matches!(columns.get(key), Some(DatabaseColumn::GroupBy { .. })) {
                return Err(ReportError::config(format!(
                    "key {key} must be a database group-by column"
                )));
            }
        }

        let filters: Vec<(String, Filter)> = definition
            .filters()
            .filter(|(_, filter)| filter.source_kind() == SourceKind::Database)
            .map(|(name, filter)| (name.to_string(), filter.clone()))
            .collect();
        for (name, filter) in &filters {
            if matches!(filter.kind, FilterKind::Transform(_)) && filter.columns.is_none() {
                return Err(ReportError::config(format!(
                    "column transform {name} must name the columns it applies to"
                )));
            }
        }

        let groups = query_groups(&declared, &columns, &keys, &filters)?;
        let lookups = lookup_groups(&declared, &columns)?;

        Ok(Self {
            db: Arc::clone(db),
            table: table.to_string(),
            keys,
            columns,
            filters,
            groups,
            lookups,
        })
    }

    fn entity<'e>(&'e self, ctx: &'e RunContext) -> Entity<'e> {
        let transforms = self
            .filters
            .iter()
            .filter_map(|(name, filter)| match (&filter.kind, &filter.columns) {
                (FilterKind::Transform(transform), Some(columns)) => {
                    Some((columns, transform, filter.user_input(name, ctx)))
                }
                _ => None,
            })
            .collect();
        Entity {
            table: &self.table,
            transforms,
        }
    }

    fn group_query(&self, group: &QueryGroup, entity: &Entity<'_>, ctx: &RunContext) -> (String, Vec<Value>) {
        let names = self.keys.iter().chain(&group.columns);
        let select: Vec<String> = names
            .filter_map(|name| self.columns.get(name))
            .map(|column| column.expression(entity))
            .collect();

        let mut conditions = Vec::new();
        let mut group_exprs = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            if let Some(DatabaseColumn::GroupBy {
                column,
                include_null,
            }) = self.columns.get(key)
            {
                let expr = entity.col(column);
                if !include_null {
                    conditions.push(Condition::is_not_null(&expr));
                }
                group_exprs.push(expr);
            }
        }
        for (i, (name, filter)) in self.filters.iter().enumerate() {
            let FilterKind::Query(query) = &filter.kind else {
                continue;
            };
            if filter.columns.is_none() || group.filter == Some(i) {
                conditions.extend(query(entity, filter.user_input(name, ctx)));
            }
        }

        let (clause, params) = where_clause(conditions);
        let mut sql = format!(
            "SELECT {} FROM {}{clause}",
            if select.is_empty() { "1".to_string() } else { select.join(", ") },
            quote_ident(&self.table)
        );
        if !group_exprs.is_empty() {
            let grouping = group_exprs.join(", ");
            sql.push_str(&format!(" GROUP BY {grouping} ORDER BY {grouping}"));
        }
        (sql, params)
    }

    fn query_stream<'a>(&'a self, group: &QueryGroup, entity: &Entity<'_>, ctx: &RunContext) -> KeyedStream<'a, Row> {
        let (sql, params) = self.group_query(group, entity, ctx);
        tracing::debug!(table = %self.table, %sql, "database query");
        let names: Vec<String> = self.keys.iter().chain(&group.columns).cloned().collect();
        let key_width = self.keys.len();
        Box::new(PagedQuery::new(&self.db, sql, params).map(move |raw| -> ReportResult<KeyedRow> {
            let raw = raw?;
            let cells: Vec<Option<Value>> = names
                .iter()
                .zip(raw)
                .map(|(name, value)| match self.columns.get(name) {
                    Some(column) => column.decode(value),
                    None => value,
                })
                .collect();
            let key = Key::new(cells[..key_width.min(cells.len())].to_vec());
            let row: Row = names.iter().cloned().zip(cells).collect();
            Ok((key, row))
        }))
    }

    fn perform_lookups(&self, staged: &mut [KeyedRow]) -> ReportResult<()> {
        for group in &self.lookups {
            let ids: BTreeSet<Value> = staged
                .iter()
                .filter_map(|(_, row)| row.get(&group.pk_column))
                .filter(|id| id.is_truthy())
                .cloned()
                .collect();
            if ids.is_empty() {
                continue;
            }

            let pk = quote_ident(&group.pk_attr);
            let attrs: Vec<String> = group.columns.iter().map(|(_, attr)| quote_ident(attr)).collect();
            let condition = Condition::is_in(&pk, ids.iter().cloned());
            let sql = format!(
                "SELECT {pk}, {} FROM {} WHERE {}",
                attrs.join(", "),
                quote_ident(&group.table),
                condition.sql
            );
            let found: BTreeMap<Value, SqlRow> = self
                .db
                .query(&sql, &condition.params)?
                .into_iter()
                .filter_map(|mut row| {
                    let id = row.remove(0)?;
                    Some((id, row))
                })
                .collect();
            tracing::debug!(table = %group.table, ids = ids.len(), found = found.len(), "lookup batch");

            for (_, row) in staged.iter_mut() {
                let Some(values) = row.get(&group.pk_column).and_then(|id| found.get(id)) else {
                    continue;
                };
                let values = values.clone();
                for ((name, _), value) in group.columns.iter().zip(values) {
                    row.set(name, value);
                }
            }
        }
        Ok(())
    }
}

fn query_groups(
    declared: &[String],
    columns: &BTreeMap<String, DatabaseColumn>,
    keys: &[String],
    filters: &[(String, Filter)],
) -> ReportResult<Vec<QueryGroup>> {
    let key_set: BTreeSet<&str> = keys.iter().map(String::as_str).collect();
    let mut filtered: BTreeSet<&str> = BTreeSet::new();
    let mut scoped = Vec::new();

    for (i, (name, filter)) in filters.iter().enumerate() {
        let (FilterKind::Query(_), Some(scope)) = (&filter.kind, &filter.columns) else {
            continue;
        };
        for column in scope {
            if key_set.contains(column.as_str()) {
                return Err(ReportError::config(format!(
                    "filter {name} cannot filter key column {column}; key columns are in every query"
                )));
            }
            if !filtered.insert(column.as_str()) {
                return Err(ReportError::config(format!(
                    "column {column} appears in more than one database filter"
                )));
            }
            if !columns.contains_key(column) {
                return Err(ReportError::config(format!(
                    "filter {name} names {column}, which is not a database column"
                )));
            }
        }
        scoped.push(QueryGroup {
            columns: scope.iter().cloned().collect(),
            filter: Some(i),
        });
    }

    let unfiltered: Vec<String> = declared
        .iter()
        .filter(|name| {
            !key_set.contains(name.as_str())
                && !filtered.contains(name.as_str())
                && columns.get(*name).is_some_and(|c| !c.is_lookup())
        })
        .cloned()
        .collect();

    let mut groups = Vec::with_capacity(scoped.len() + 1);
    if !unfiltered.is_empty() || scoped.is_empty() {
        groups.push(QueryGroup {
            columns: unfiltered,
            filter: None,
        });
    }
    groups.extend(scoped);
    Ok(groups)
}

fn lookup_groups(
    declared: &[String],
    columns: &BTreeMap<String, DatabaseColumn>,
) -> ReportResult<Vec<LookupGroup>> {
    let mut groups: Vec<LookupGroup> = Vec::new();
    for name in declared {
        let Some(DatabaseColumn::Lookup(lookup)) = columns.get(name) else {
            continue;
        };
        if !columns
            .get(&lookup.pk_column)
            .is_some_and(|c| !c.is_lookup())
        {
            return Err(ReportError::config(format!(
                "lookup {name} reads its key from {}, which is not a database column",
                lookup.pk_column
            )));
        }
        let existing = groups.iter_mut().find(|g| {
            g.table == lookup.table && g.pk_attr == lookup.pk_attr && g.pk_column == lookup.pk_column
        });
        let entry = (name.clone(), lookup.attr.clone());
        match existing {
            Some(group) => group.columns.push(entry),
            None => groups.push(LookupGroup {
                table: lookup.table.clone(),
                pk_attr: lookup.pk_attr.clone(),
                pk_column: lookup.pk_column.clone(),
                columns: vec![entry],
            }),
        }
    }
    Ok(groups)
}

impl Source for DatabaseSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Database
    }

    fn get_rows<'a>(
        &'a self,
        key_rows: KeyRows<'a>,
        ctx: &'a RunContext,
    ) -> ReportResult<KeyedStream<'a, Row>> {
        let entity = self.entity(ctx);
        let mut streams: Vec<KeyedStream<'a, Row>> = Vec::with_capacity(self.groups.len() + 1);
        streams.push(Box::new(key_rows.map(Ok::<KeyedRow, ReportError>)));
        for group in &self.groups {
            streams.push(self.query_stream(group, &entity, ctx));
        }
        Ok(Box::new(DatabaseRows {
            source: self,
            merge: KMerge::new(streams),
            current: None,
            ready: VecDeque::new(),
            done: false,
        }))
    }
}

/// Folds the merged query streams into one row per key, with lookups
/// applied in batches of staged rows.
struct DatabaseRows<'a> {
    source: &'a DatabaseSource,
    merge: KMerge<'a, Row>,
    current: Option<KeyedRow>,
    ready: VecDeque<KeyedRow>,
    done: bool,
}

impl DatabaseRows<'_> {
    fn fill(&mut self) -> ReportResult<()> {
        let mut staged = Vec::new();
        loop {
            let Some(item) = self.merge.next() else {
                staged.extend(self.current.take());
                self.done = true;
                break;
            };
            let (key, _, partial) = item?;
            let same = matches!(&self.current, Some((current, _)) if *current == key);
            if same {
                if let Some((_, row)) = self.current.as_mut() {
                    row.merge(partial);
                }
            } else if let Some(finished) = self.current.replace((key, partial)) {
                staged.push(finished);
                if staged.len() >= QUERY_LIMIT {
                    break;
                }
            }
        }
        self.source.perform_lookups(&mut staged)?;
        self.ready.extend(staged);
        Ok(())
    }
}

impl Iterator for DatabaseRows<'_> {
    type Item = ReportResult<KeyedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.ready.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
